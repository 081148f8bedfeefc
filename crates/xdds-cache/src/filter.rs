// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seams towards the type system and the filter/query interpreter.
//!
//! The cache never parses payloads itself. Content filters and query/order
//! programs reach it as trait objects that carry their own compiled program,
//! parameters and evaluation cache; the cache hands them payload bytes and
//! consumes a boolean or an ordering. Key hashing follows the DDS key-hash
//! construction: short keys travel verbatim (zero padded), long or secure
//! keys are MD5-digested.

use std::cmp::Ordering;

use md5::{Digest, Md5};

use crate::types::{KeyHash, KEY_HASH_SIZE};
use crate::Result;

/// Key extraction and hashing support supplied by the type system.
pub trait KeySupport: Send + Sync {
    /// Derive the 16-byte instance hash from a serialised key.
    fn hash_from_key(&self, key: &[u8], secure: bool) -> Result<KeyHash>;

    /// Convert a serialised key to its native field layout.
    ///
    /// The stock implementation returns the bytes unchanged; typed layers
    /// override this to re-order CDR key fields.
    fn key_to_native(&self, key: &[u8], secure: bool) -> Result<Vec<u8>> {
        let _ = secure;
        Ok(key.to_vec())
    }
}

/// Stock key support: identity layout for short non-secure keys, MD5
/// otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct Md5KeySupport;

impl KeySupport for Md5KeySupport {
    fn hash_from_key(&self, key: &[u8], secure: bool) -> Result<KeyHash> {
        let mut hash = [0u8; KEY_HASH_SIZE];
        if !secure && key.len() <= KEY_HASH_SIZE {
            hash[..key.len()].copy_from_slice(key);
        } else {
            let mut hasher = Md5::new();
            hasher.update(key);
            hash.copy_from_slice(&hasher.finalize());
        }
        Ok(KeyHash(hash))
    }
}

/// A compiled content-filter program bound to its parameters.
pub trait SampleFilter: Send + Sync {
    /// Evaluate the filter against one payload.
    fn matches(&self, payload: &[u8]) -> Result<bool>;
}

/// A compiled ordering program bound to its parameters.
///
/// The comparator owns all evaluation context, so concurrent `get` sorts
/// need no shared state.
pub trait SampleOrder: Send + Sync {
    /// Compare two payloads.
    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering>;
}

impl<F> SampleFilter for F
where
    F: Fn(&[u8]) -> Result<bool> + Send + Sync,
{
    fn matches(&self, payload: &[u8]) -> Result<bool> {
        self(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_key_is_identity_padded() {
        let hash = Md5KeySupport
            .hash_from_key(&[1, 2, 3, 4], false)
            .expect("hash");
        let mut expect = [0u8; KEY_HASH_SIZE];
        expect[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(hash, KeyHash(expect));
    }

    #[test]
    fn long_key_is_digested() {
        let key = [7u8; 40];
        let hash = Md5KeySupport.hash_from_key(&key, false).expect("hash");
        assert_ne!(hash.as_bytes()[..16], key[..16]);
        // Digest is deterministic.
        let again = Md5KeySupport.hash_from_key(&key, false).expect("hash");
        assert_eq!(hash, again);
    }

    #[test]
    fn secure_mode_always_digests() {
        let key = [1u8, 2, 3, 4];
        let plain = Md5KeySupport.hash_from_key(&key, false).expect("hash");
        let secure = Md5KeySupport.hash_from_key(&key, true).expect("hash");
        assert_ne!(plain, secure);
    }

    #[test]
    fn closure_filters_work() {
        let filter = |payload: &[u8]| Ok(payload.first() == Some(&1));
        assert!(SampleFilter::matches(&filter, &[1, 9]).expect("eval"));
        assert!(!SampleFilter::matches(&filter, &[2]).expect("eval"));
    }
}
