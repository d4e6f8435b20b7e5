// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt::{self, Debug};

use data_encoding::BASE64URL;
use rand::{rng, Rng};
use zeroize::Zeroizing;

use crate::guard::{GuardError, GuardResult};

/// A handle for memory designed to safely handle volume passphrases. The
/// contents are wiped when the handle is dropped. It can be coerced to a
/// slice reference for use in read-only operations.
#[derive(Clone)]
pub struct SizedKeyMemory {
    mem: Zeroizing<Vec<u8>>,
}

impl SizedKeyMemory {
    pub fn new(mem: Vec<u8>) -> SizedKeyMemory {
        SizedKeyMemory {
            mem: Zeroizing::new(mem),
        }
    }

    /// Generate a new passphrase from `size` random bytes. The passphrase is
    /// the URL-safe base64 encoding of those bytes so that it can be handed
    /// to cryptsetup and stored in text-only key stores unchanged.
    pub fn generate(size: usize) -> GuardResult<SizedKeyMemory> {
        if size == 0 {
            return Err(GuardError::Msg(
                "Refusing to generate an empty passphrase".to_string(),
            ));
        }
        let mut raw = Zeroizing::new(vec![0u8; size]);
        rng().fill(&mut raw[..]);
        Ok(SizedKeyMemory::new(BASE64URL.encode(&raw).into_bytes()))
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Interpret the passphrase as text, as required by stores that only
    /// hold strings.
    pub fn as_str(&self) -> GuardResult<&str> {
        std::str::from_utf8(&self.mem)
            .map_err(|e| GuardError::Msg(format!("Passphrase is not valid UTF-8: {e}")))
    }
}

impl From<&str> for SizedKeyMemory {
    fn from(s: &str) -> SizedKeyMemory {
        SizedKeyMemory::new(s.as_bytes().to_vec())
    }
}

impl Debug for SizedKeyMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SizedKeyMemory {{ len: {} }}", self.len())
    }
}

impl AsRef<[u8]> for SizedKeyMemory {
    fn as_ref(&self) -> &[u8] {
        &self.mem
    }
}

impl PartialEq for SizedKeyMemory {
    fn eq(&self, other: &SizedKeyMemory) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl Eq for SizedKeyMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Generated passphrases are distinct and encode the requested number
    /// of random bytes.
    fn test_generate() {
        let first = SizedKeyMemory::generate(20).unwrap();
        let second = SizedKeyMemory::generate(20).unwrap();
        assert_ne!(first, second);
        assert_eq!(BASE64URL.decode(first.as_ref()).unwrap().len(), 20);
        assert_matches!(SizedKeyMemory::generate(0), Err(_));
    }

    #[test]
    fn test_debug_hides_contents() {
        let key = SizedKeyMemory::from("supersecret");
        assert!(!format!("{key:?}").contains("supersecret"));
    }
}
