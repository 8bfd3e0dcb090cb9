// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use rand::Rng;
use rand::distr::Alphanumeric;

/// Eight lowercase hex digits from a random `u32`.
pub fn rand32() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// `<base>-<rand32>`.
pub fn generate_name(base: &str) -> String {
    format!("{base}-{}", rand32())
}

pub fn random_alphanumeric(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{generate_name, rand32, random_alphanumeric};

    #[test]
    fn generated_names_have_hex_suffix() {
        let name = generate_name("vmc");
        let suffix = name.strip_prefix("vmc-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rand32().len(), 8);
    }

    #[test]
    fn alphanumeric_has_requested_length() {
        let password = random_alphanumeric(16);
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
