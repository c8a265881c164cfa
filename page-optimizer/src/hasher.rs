// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Content hashing for rewritten URLs and cache keys

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Number of characters in the hash embedded into rewritten URLs
pub const HASH_LENGTH: usize = 10;

/// Maximal length of a hash accepted when decoding URLs
pub const MAX_HASH_LENGTH: usize = 32;

/// Hashes some data, producing a string from the alphabet `[A-Za-z0-9_-]`.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hash = URL_SAFE_NO_PAD.encode(Sha256::digest(data));
    hash.truncate(HASH_LENGTH);
    hash
}

/// Hashes a sequence of strings. Separators are included so that `["ab", "c"]` and
/// `["a", "bc"]` produce different hashes.
pub fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    let mut hash = URL_SAFE_NO_PAD.encode(hasher.finalize());
    hash.truncate(HASH_LENGTH);
    hash
}

/// Checks whether a string could have been produced by this hasher (or a hasher with a
/// different length configuration).
pub fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty()
        && hash.len() <= MAX_HASH_LENGTH
        && hash
            .bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
}
