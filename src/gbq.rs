// Copyright 2024, The Tremor Team
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

/// metadata and write clients
pub mod client;
/// JSON to protobuf row conversion
pub mod row;
/// row schema derived from a table schema
pub mod schema;
/// the stream writer output
pub mod writer;

/// The offset the service reports for appends to the default stream
pub const NO_STREAM_OFFSET: i64 = -1;
