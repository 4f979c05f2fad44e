// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;

use chrono::Utc;
use rand::Rng;
use regex::Regex;

/// Prefix for thread ids minted by this binary.
pub const THREAD_ID_PREFIX: &str = "lace";

const SUFFIX_LEN: usize = 6;
const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Mint a new thread id of the form `<prefix>_YYYYMMDD_<6 lowercase alnum>`,
/// e.g. `lace_20250615_abc123`.
pub fn generate_thread_id(prefix: &str) -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{prefix}_{date}_{suffix}")
}

/// Check an id against the canonical format `^[a-z]+_[0-9]{8}_[a-z0-9]{6}$`.
pub fn is_valid_thread_id(id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+_[0-9]{8}_[a-z0-9]{6}$").expect("static regex"))
        .is_match(id)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
