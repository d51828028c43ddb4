// larynx - SIP signaling for voice-AI agents
// Copyright (C) 2025 The larynx developers
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Random protocol identifiers: branches, tags, Call-IDs, CSeq seeds.

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::via::BRANCH_MAGIC_COOKIE;

/// Generates an RFC 3261 branch: the magic cookie plus 16 random
/// alphanumerics (~95 bits of entropy).
pub fn generate_branch() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", BRANCH_MAGIC_COOKIE, suffix))
}

/// Generates a From/To tag: 8 random bytes, hex-encoded (64 bits).
pub fn generate_tag() -> SmolStr {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    SmolStr::new(hex(&bytes))
}

/// Generates a Call-ID of the form `<random-hex>@<host>`.
pub fn generate_call_id(host: &str) -> SmolStr {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    SmolStr::new(format!("{}@{}", hex(&bytes), host))
}

/// Random 31-bit CSeq seed for a new dialog (RFC 3261 §12.2.1.1 keeps the
/// top bit clear so increments cannot wrap past 2^31).
pub fn generate_cseq_seed() -> u32 {
    rand::thread_rng().gen_range(1..=0x7fff_ffff)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::via::is_rfc3261_branch;
    use std::collections::HashSet;

    #[test]
    fn branches_carry_magic_cookie_and_differ() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let branch = generate_branch();
            assert!(is_rfc3261_branch(&branch));
            assert!(seen.insert(branch));
        }
    }

    #[test]
    fn tags_are_hex_with_64_bits() {
        let tag = generate_tag();
        assert_eq!(tag.len(), 16);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn call_id_includes_host() {
        let call_id = generate_call_id("ua.example.com");
        assert!(call_id.ends_with("@ua.example.com"));
        assert!(call_id.split('@').next().unwrap().len() == 32);
    }

    #[test]
    fn cseq_seed_is_31_bit() {
        for _ in 0..100 {
            let seed = generate_cseq_seed();
            assert!(seed >= 1);
            assert!(seed <= 0x7fff_ffff);
        }
    }
}
