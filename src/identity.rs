// SPDX-License-Identifier: MPL-2.0

//! Stable identity of a decode input.

use std::fmt;

use crate::source::ImageSource;

/// Deterministic hash of an input source, computed once per session.
///
/// URL inputs are keyed by the URL text, byte inputs by their content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceIdentity(blake3::Hash);

impl ResourceIdentity {
    #[must_use]
    pub fn of(source: &ImageSource) -> Self {
        let mut hasher = blake3::Hasher::new();
        match source {
            ImageSource::Url(url) => {
                hasher.update(b"url:");
                hasher.update(url.as_bytes());
            }
            ImageSource::Bytes(bytes) => {
                hasher.update(b"bytes:");
                hasher.update(bytes);
            }
        }
        Self(hasher.finalize())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceIdentity({})", &self.to_hex()[..16])
    }
}
