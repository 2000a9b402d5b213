//! Scan orchestration.
//!
//! Drives the enumerator and, per image, the reader → assembler → usage
//! pipeline. Per-image pipelines share no mutable state, so they run
//! concurrently up to `ScanConfig::max_concurrency`; one image's failure is
//! recorded as that image's status and never blocks the rest. Only session
//! faults and cancellation abort a call.

use futures::stream::{self, StreamExt};
use imagemeta_common::{Error, ImageInfo, InfoFilter, Result, ScanConfig, ScanStatus};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::assemble::{self, ParentIndex};
use crate::enumerate;
use crate::reader::{self, RawImage, KEY_PARENT};
use crate::session::PoolSession;
use crate::usage;
use crate::{header_object, object_map_object};

/// Bulk-scan result: image id to record and terminal status. A failed image
/// carries `None` and a non-zero status; an `Incomplete` image carries its
/// record with the unusable usage fields left `None`.
pub type ScanOutput = BTreeMap<String, (Option<ImageInfo>, ScanStatus)>;

/// Stateless scan driver. Cheap to construct; holds only configuration.
#[derive(Clone, Debug, Default)]
pub struct Scanner {
    config: ScanConfig,
}

impl Scanner {
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Enumerate the pool's image directory: id → name.
    pub async fn list(&self, session: &dyn PoolSession) -> Result<BTreeMap<String, String>> {
        enumerate::list_images(session, self.config.list_page_size).await
    }

    /// Query a single image by id and name. No enumeration is involved
    /// unless `CHILDREN_V1` forces the pool-wide lineage pass.
    pub async fn get_info(
        &self,
        session: &dyn PoolSession,
        image_id: &str,
        name: &str,
        filter: InfoFilter,
    ) -> Result<(Option<ImageInfo>, ScanStatus)> {
        let index = self.maybe_build_parent_index(session, filter).await?;
        self.scan_one(session, image_id, name, filter, index.as_ref())
            .await
    }

    /// Scan the whole pool, or just `images` when the caller supplies an
    /// explicit id → name set (skipping enumeration).
    ///
    /// The result covers every requested image with a terminal status; the
    /// call as a whole succeeds even if every image failed. `cancel`
    /// observing `true` stops issuing new per-image work and returns
    /// `Error::Cancelled`; in-flight pipelines are dropped (the session is
    /// read-only, nothing leaks).
    pub async fn list_info(
        &self,
        session: &dyn PoolSession,
        images: Option<BTreeMap<String, String>>,
        filter: InfoFilter,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ScanOutput> {
        if is_cancelled(&cancel) {
            return Err(Error::Cancelled);
        }

        let images = match images {
            Some(images) => images,
            None => self.list(session).await?,
        };
        info!(
            images = images.len(),
            filter = filter.bits(),
            "pool scan started"
        );

        let index = self.maybe_build_parent_index(session, filter).await?;
        let index_ref = index.as_ref();

        let work = images.iter().map(|(id, name)| {
            let id = id.clone();
            let name = name.clone();
            async move {
                let outcome = self
                    .scan_one(session, &id, &name, filter, index_ref)
                    .await;
                (id, outcome)
            }
        });
        let mut pipeline =
            stream::iter(work).buffer_unordered(self.config.effective_concurrency());

        let mut out = ScanOutput::new();
        loop {
            tokio::select! {
                biased;
                () = wait_cancelled(&mut cancel) => {
                    warn!(completed = out.len(), "pool scan cancelled; abandoning in-flight images");
                    return Err(Error::Cancelled);
                }
                next = pipeline.next() => match next {
                    Some((id, Ok(pair))) => {
                        out.insert(id, pair);
                    }
                    Some((id, Err(e))) => {
                        warn!(image_id = %id, error = %e, "session fault; aborting scan");
                        return Err(e);
                    }
                    None => break,
                }
            }
        }

        let failures = out.values().filter(|(_, status)| !status.is_ok()).count();
        info!(images = out.len(), failures, "pool scan complete");
        Ok(out)
    }

    /// One image's pipeline. `Err` only for session faults; every per-image
    /// outcome is a status.
    async fn scan_one(
        &self,
        session: &dyn PoolSession,
        image_id: &str,
        name: &str,
        filter: InfoFilter,
        index: Option<&ParentIndex>,
    ) -> Result<(Option<ImageInfo>, ScanStatus)> {
        let raw = match reader::read_image(session, image_id, filter, self.config.list_page_size)
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.is_session_fault() => return Err(e),
            Err(e) => {
                warn!(image_id, error = %e, "image unreadable");
                return Ok((None, ScanStatus::from_error(&e)));
            }
        };

        let mut info = match assemble::assemble(&raw, name, index) {
            Ok(info) => info,
            Err(e) => {
                warn!(image_id, error = %e, "record assembly failed");
                return Ok((None, ScanStatus::from_error(&e)));
            }
        };

        let mut status = ScanStatus::Ok;
        if filter.wants_usage() {
            status = self.apply_usage(session, &mut info, &raw, filter).await?;
        }
        debug!(image_id, status = status.code(), "image scanned");
        Ok((Some(info), status))
    }

    /// Fill usage fields in place. Unusable or inconsistent bitmaps degrade
    /// the image to `Incomplete` with the affected fields left `None`; the
    /// record itself is still returned.
    async fn apply_usage(
        &self,
        session: &dyn PoolSession,
        info: &mut ImageInfo,
        raw: &RawImage,
        filter: InfoFilter,
    ) -> Result<ScanStatus> {
        let image_id = info.id.clone();
        let order = info.order;
        let has_map = info.has_object_map();
        let fast_diff = info.has_fast_diff();
        let mut incomplete = false;

        if filter.contains(InfoFilter::SNAP_DU) {
            for snap in info.snaps.values_mut() {
                let counts = if has_map {
                    match raw.snap_object_maps.get(&snap.id) {
                        Some(blob) => {
                            let oid = object_map_object(&image_id, Some(snap.id));
                            match usage::usage_from_object_map(
                                blob, &oid, snap.size, order, fast_diff,
                            ) {
                                Ok(counts) => Some(counts),
                                Err(e) => {
                                    warn!(image_id = %image_id, snap_id = snap.id, error = %e, "snapshot object map unusable");
                                    None
                                }
                            }
                        }
                        None => {
                            warn!(image_id = %image_id, snap_id = snap.id, "snapshot object map missing");
                            None
                        }
                    }
                } else {
                    match usage::usage_by_stat(session, &image_id, Some(snap.id), snap.size, order)
                        .await
                    {
                        Ok(counts) => Some(counts),
                        Err(e) if e.is_session_fault() => return Err(e),
                        Err(e) => {
                            warn!(image_id = %image_id, snap_id = snap.id, error = %e, "snapshot stat pass failed");
                            None
                        }
                    }
                };
                match counts {
                    Some(counts) => {
                        snap.du = Some(counts.du);
                        snap.dirty = Some(counts.dirty);
                    }
                    None => incomplete = true,
                }
            }
        }

        if filter.contains(InfoFilter::IMAGE_DU) {
            let counts = if has_map {
                match &raw.head_object_map {
                    Some(blob) => {
                        let oid = object_map_object(&image_id, None);
                        match usage::usage_from_object_map(blob, &oid, info.size, order, fast_diff)
                        {
                            Ok(counts) => Some(counts),
                            Err(e) => {
                                warn!(image_id = %image_id, error = %e, "head object map unusable");
                                None
                            }
                        }
                    }
                    None => {
                        warn!(image_id = %image_id, "head object map missing");
                        None
                    }
                }
            } else {
                match usage::usage_by_stat(session, &image_id, None, info.size, order).await {
                    Ok(counts) => Some(counts),
                    Err(e) if e.is_session_fault() => return Err(e),
                    Err(e) => {
                        warn!(image_id = %image_id, error = %e, "head stat pass failed");
                        None
                    }
                }
            };
            match counts {
                Some(counts) => {
                    info.du = Some(counts.du);
                    info.dirty = Some(counts.dirty);
                }
                None => incomplete = true,
            }
        }

        Ok(if incomplete {
            ScanStatus::Incomplete
        } else {
            ScanStatus::Ok
        })
    }

    /// Pool-wide reverse-lineage pass: one parent-linkage read per image.
    /// Only runs under `CHILDREN_V1`; this is the O(images) cost that flag
    /// opts into.
    async fn maybe_build_parent_index(
        &self,
        session: &dyn PoolSession,
        filter: InfoFilter,
    ) -> Result<Option<ParentIndex>> {
        if !filter.contains(InfoFilter::CHILDREN_V1) {
            return Ok(None);
        }

        let ids = enumerate::list_images(session, self.config.list_page_size).await?;
        let local_pool = session.pool_id();
        let local_ns = session.pool_namespace().to_string();

        let fetches = ids.keys().map(|id| {
            let id = id.clone();
            async move {
                let oid = header_object(&id);
                let parent = match session.omap_get(&oid, KEY_PARENT).await {
                    Ok(Some(blob)) => reader::decode_parent(&oid, &blob).map(Some),
                    Ok(None) => Ok(None),
                    // the image vanished between enumeration and this read
                    Err(Error::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                };
                (id, parent)
            }
        });
        let results: Vec<_> = stream::iter(fetches)
            .buffer_unordered(self.config.effective_concurrency())
            .collect()
            .await;

        let mut index = ParentIndex::new();
        for (id, parent) in results {
            match parent {
                Ok(Some(parent)) => {
                    index.insert(&parent, &id, local_pool, &local_ns, local_pool, &local_ns);
                }
                Ok(None) => {}
                Err(e) if e.is_session_fault() => return Err(e),
                Err(e) => {
                    warn!(image_id = %id, error = %e, "parent linkage unreadable; lineage may be incomplete");
                }
            }
        }
        debug!(
            parents = ids.len(),
            indexed = !index.is_empty(),
            "lineage index built"
        );
        Ok(Some(index))
    }
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolves once cancellation is observed; pends forever when no cancel
/// channel was supplied or its sender is gone.
async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = cancel.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
