// Copyright 2021 The yadcc developers
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

error_chain! {
    foreign_links {
        Io(::std::io::Error);
        Bincode(::bincode::Error);
        Json(::serde_json::Error);
    }

    errors {
        /// Wrong or expired token at an RPC boundary.
        AccessDenied {
            description("access denied")
        }
        /// Malformed or out-of-range RPC field.
        InvalidArgument(what: String) {
            description("invalid argument")
            display("invalid argument: {}", what)
        }
        /// The servant lacks the requested toolchain.
        EnvironmentNotAvailable {
            description("requested environment is not available")
        }
        /// The scheduler could not place the task within the caller's timeout.
        NoQuotaAvailable {
            description("no quota available")
        }
        /// Cache miss, or an unknown grant / task id.
        NotFound {
            description("not found")
        }
        /// RPC timeout or connection failure.
        Transport(what: String) {
            description("transport error")
            display("transport error: {}", what)
        }
        /// A cache entry failed its integrity check.
        CorruptedEntry {
            description("corrupted cache entry")
        }
        /// A local quota waiter timed out.
        Unavailable {
            description("unavailable")
        }
    }
}
