// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Object store module
//
// Trait-based abstraction over the durable store batch files are uploaded
// to (S3 in the field, a local directory for bench setups and tests).
//
// This module focuses on WRITE-ONLY operations.

pub mod backend;
pub mod factory;
pub mod filesystem;
pub mod s3;

pub use backend::ObjectStore;
pub use factory::BackendFactory;
pub use filesystem::FilesystemBackend;
pub use s3::S3Backend;
