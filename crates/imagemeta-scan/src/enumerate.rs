//! Image namespace enumeration.
//!
//! Walks the pool's image directory omap and returns the id → name mapping.
//! The directory may be mutated concurrently by other clients; the result is
//! a best-effort snapshot in time, and an image that disappears after
//! enumeration simply fails its own per-image read later.

use bytes::Bytes;
use imagemeta_common::{Error, Result};
use std::collections::BTreeMap;
use tracing::warn;

use crate::session::PoolSession;
use crate::{DIRECTORY_ID_PREFIX, DIRECTORY_OBJECT};

/// List every image registered in the pool's image directory.
///
/// A missing directory object means an empty pool, not an error. Session
/// faults (unreachable, pool-level permission denial) propagate.
pub async fn list_images(
    session: &dyn PoolSession,
    page_size: usize,
) -> Result<BTreeMap<String, String>> {
    let mut images = BTreeMap::new();
    let mut start_after = String::new();
    let page_size = page_size.max(1);

    loop {
        let page = match session
            .omap_list(DIRECTORY_OBJECT, &start_after, page_size)
            .await
        {
            Ok(page) => page,
            Err(Error::NotFound(_)) => return Ok(images),
            Err(e) => return Err(e),
        };
        let full_page = page.len() == page_size;

        for (key, value) in page {
            start_after = key.clone();
            let Some(id) = key.strip_prefix(DIRECTORY_ID_PREFIX) else {
                // name_ reverse entries and anything else are not ours
                continue;
            };
            match decode_name(&value) {
                Some(name) => {
                    images.insert(id.to_string(), name);
                }
                None => warn!(image_id = id, "skipping directory entry with malformed name"),
            }
        }

        if !full_page {
            return Ok(images);
        }
    }
}

fn decode_name(value: &Bytes) -> Option<String> {
    std::str::from_utf8(value).ok().map(str::to_string)
}
