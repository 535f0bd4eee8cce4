//! Capacity allocation: direct by guid, or automatic over the whole pool.

use tracing::{debug, warn};

use crate::registry::{DeviceContext, DevicePool};
use crate::session::DeviceSession;
use crate::shm::lock::MAX_LOCK_RETRIES;
use crate::shm::{DeviceRecord, NamedLock, Namespace, PoolIndex};
use crate::types::{AllocRule, Codec, DeviceType, Guid};
use crate::{PoolError, Result};

/// Encoder admission reference: 1080p at 240fps worth of pixel rate.
const REFERENCE_PIXEL_RATE: u64 = 1920 * 1080 * 240;

/// Stream parameters of an allocation request.
#[derive(Debug, Clone, Copy)]
pub struct AllocRequest {
    pub codec: Codec,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

impl AllocRequest {
    /// Pixel rate this stream will consume.
    pub fn pixel_rate(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.fps as u64
    }

    fn validate(&self) -> Result<()> {
        if self.width <= 0 || self.height <= 0 || self.fps <= 0 {
            return Err(PoolError::InvalidParameter(
                "width, height and fps must be positive",
            ));
        }
        Ok(())
    }
}

/// A granted allocation. Dropping it releases the process-local handle but
/// keeps the admitted load; callers return that through
/// [`Allocator::release`] when the stream ends.
#[derive(Debug)]
pub struct Allocation {
    pub context: DeviceContext,
    /// Pixel rate admitted against the engine, zero for decoders.
    pub load: u64,
}

/// Maximum pixel rate an encoder admits for `codec`.
pub fn reference_capacity(codec: Codec) -> u64 {
    // One reference stream per codec for now; the table exists so codecs
    // can be weighted separately later.
    match codec {
        Codec::H264 | Codec::H265 | Codec::Vp9 | Codec::Jpeg | Codec::Av1 => {
            REFERENCE_PIXEL_RATE
        }
    }
}

/// Hands out engines from one pool namespace.
pub struct Allocator<'a> {
    ns: Namespace,
    session: &'a dyn DeviceSession,
    rotate: bool,
}

impl<'a> Allocator<'a> {
    pub fn new(ns: Namespace, session: &'a dyn DeviceSession) -> Self {
        Allocator {
            ns,
            session,
            rotate: false,
        }
    }

    /// Enables moving the winner to the tail of the index after each
    /// automatic allocation, spreading work across equally loaded engines.
    pub fn with_rotation(mut self, rotate: bool) -> Self {
        self.rotate = rotate;
        self
    }

    /// Picks the best engine per `rule` and admits the stream on it.
    ///
    /// Every candidate is re-queried live and its shared record updated
    /// before scoring, so placement never trusts stale state. Concurrent
    /// automatic allocations of the same engine type are rate-limited by a
    /// per-type lock held for the duration of the scan.
    pub fn allocate_auto(
        &self,
        device_type: DeviceType,
        rule: AllocRule,
        req: AllocRequest,
    ) -> Result<Allocation> {
        req.validate()?;

        let rate_limit = NamedLock::open(&self.ns.retry_lock(device_type))?;
        let _rate_guard = rate_limit.lock_bounded(MAX_LOCK_RETRIES)?;

        let pool = DevicePool::open(&self.ns)?;
        pool.with_index_mut(|index| {
            let (guid, ctx) = self
                .best_candidate(index, device_type, rule, req.codec)?
                .ok_or(PoolError::NoDeviceAvailable { device_type })?;

            let load = if device_type == DeviceType::Encoder {
                admit_pixels(&ctx, &req)?
            } else {
                0
            };

            if self.rotate {
                index.move_to_tail(device_type, guid);
            }
            debug!(guid, %device_type, ?rule, load, "allocated via pool scan");
            Ok(Allocation { context: ctx, load })
        })
    }

    /// Admits a stream on a specific engine, no questions asked. Used when
    /// the caller already owns placement; there is no capacity gate here.
    pub fn allocate_direct(
        &self,
        device_type: DeviceType,
        guid: Guid,
        req: AllocRequest,
    ) -> Result<Allocation> {
        let ctx = DeviceContext::open(&self.ns, device_type, guid)?;
        let load = if device_type == DeviceType::Encoder {
            req.validate()?;
            let pixels = req.pixel_rate();
            ctx.with_record_mut(|rec| {
                rec.xcode_load_pixel += pixels;
                Ok(())
            })?;
            pixels
        } else {
            0
        };

        if self.rotate {
            let pool = DevicePool::open(&self.ns)?;
            pool.with_index_mut(|index| {
                index.move_to_tail(device_type, guid);
                Ok(())
            })?;
        }
        debug!(guid, %device_type, load, "allocated directly");
        Ok(Allocation { context: ctx, load })
    }

    /// Returns the admitted pixel rate of a finished stream. Underflow
    /// means the books were already wrong somewhere; warn and clamp to
    /// zero instead of wrapping.
    pub fn release(&self, context: &DeviceContext, load: u64) -> Result<()> {
        if load == 0 {
            return Ok(());
        }
        context.with_record_mut(|rec| {
            if rec.xcode_load_pixel < load {
                warn!(
                    guid = context.guid(),
                    device_type = %context.device_type(),
                    admitted = rec.xcode_load_pixel,
                    released = load,
                    "release exceeds admitted load, clamping to zero"
                );
                rec.xcode_load_pixel = 0;
            } else {
                rec.xcode_load_pixel -= load;
            }
            Ok(())
        })
    }

    /// Least-loaded engine that could fit the stream right now, without
    /// admitting anything.
    pub fn best_available(
        &self,
        device_type: DeviceType,
        req: AllocRequest,
    ) -> Result<Guid> {
        req.validate()?;
        let pool = DevicePool::open(&self.ns)?;
        pool.with_index(|index| {
            let (guid, ctx) = self
                .best_candidate(index, device_type, AllocRule::LeastLoad, req.codec)?
                .ok_or(PoolError::NoDeviceAvailable { device_type })?;

            if device_type == DeviceType::Encoder {
                let requested = req.pixel_rate();
                let capacity = reference_capacity(req.codec);
                let current = ctx.with_record(|rec| rec.xcode_load_pixel)?;
                if requested + current > capacity {
                    return Err(PoolError::NoDeviceAvailable { device_type });
                }
            }
            Ok(guid)
        })
    }

    /// Scans one engine list under the held pool lock, refreshing every
    /// reachable record from a live query, and returns the best-scoring
    /// candidate. Earlier-listed engines win ties. Unreachable engines are
    /// skipped; a dead card must not block placement on the others.
    fn best_candidate(
        &self,
        index: &PoolIndex,
        device_type: DeviceType,
        rule: AllocRule,
        codec: Codec,
    ) -> Result<Option<(Guid, DeviceContext)>> {
        let mut best: Option<(Guid, DeviceContext, u32)> = None;
        for &guid in index.guids(device_type) {
            let ctx = match DeviceContext::open(&self.ns, device_type, guid) {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(guid, %device_type, error = %e, "skipping unreachable record");
                    continue;
                }
            };
            let (device_path, block_path, supported) = ctx.with_record(|rec| {
                (
                    rec.device_path().to_string(),
                    rec.block_path().to_string(),
                    rec.supports(codec),
                )
            })?;
            if !supported {
                continue;
            }

            let handle = match self
                .session
                .open(device_path.as_ref(), block_path.as_ref())
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(guid, device = %device_path, error = %e, "skipping unopenable device");
                    continue;
                }
            };
            let query = match handle.load_query(device_type) {
                Ok(query) => query,
                Err(e) => {
                    warn!(guid, device = %device_path, error = %e, "load query failed, skipping");
                    continue;
                }
            };

            let score = ctx.with_record_mut(|rec| {
                rec.apply_load(&query);
                Ok(score(rec, device_type, rule))
            })?;

            let better = match &best {
                None => true,
                Some((_, _, best_score)) => score < *best_score,
            };
            if better {
                best = Some((guid, ctx, score));
            }
        }
        Ok(best.map(|(guid, ctx, _)| (guid, ctx)))
    }
}

/// Lower is better. Encoders are compared on the firmware load model,
/// decoders on measured load.
fn score(rec: &DeviceRecord, device_type: DeviceType, rule: AllocRule) -> u32 {
    match rule {
        AllocRule::LeastLoad => match device_type {
            DeviceType::Encoder => rec.model_load,
            DeviceType::Decoder => rec.current_load,
        },
        AllocRule::LeastInstances => rec.active_instances,
    }
}

/// Capacity-gated admission on one encoder record; check and add happen
/// under the same record lock.
fn admit_pixels(ctx: &DeviceContext, req: &AllocRequest) -> Result<u64> {
    let requested = req.pixel_rate();
    let capacity = reference_capacity(req.codec);
    ctx.with_record_mut(|rec| {
        if requested + rec.xcode_load_pixel > capacity {
            return Err(PoolError::CapacityExceeded {
                requested,
                current: rec.xcode_load_pixel,
                capacity,
            });
        }
        rec.xcode_load_pixel += requested;
        Ok(requested)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sim::SimSession;
    use std::process;

    fn unique_ns(test: &str) -> Namespace {
        Namespace::new(format!("vtxtest_alloc_{test}_{}", process::id()))
    }

    fn hd30() -> AllocRequest {
        AllocRequest {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            fps: 30,
        }
    }

    #[test]
    fn request_validation_rejects_nonpositive_dimensions() {
        let bad = AllocRequest {
            codec: Codec::H264,
            width: 0,
            height: 1080,
            fps: 30,
        };
        assert!(matches!(
            bad.validate(),
            Err(PoolError::InvalidParameter(_))
        ));
    }

    #[test]
    fn release_clamps_instead_of_underflowing() {
        let ns = unique_ns("clamp");
        let record = DeviceRecord::new(DeviceType::Encoder, 0);
        let ctx = DeviceContext::create(&ns, DeviceType::Encoder, 0, record).unwrap();
        ctx.with_record_mut(|rec| {
            rec.xcode_load_pixel = 100;
            Ok(())
        })
        .unwrap();

        let sim = SimSession::default();
        let alloc = Allocator::new(ns.clone(), &sim);
        alloc.release(&ctx, 500).unwrap();
        assert_eq!(ctx.snapshot().unwrap().xcode_load_pixel, 0);

        drop(ctx);
        DeviceContext::destroy(&ns, DeviceType::Encoder, 0).unwrap();
    }

    #[test]
    fn admission_is_capacity_gated() {
        let ns = unique_ns("gate");
        let record = DeviceRecord::new(DeviceType::Encoder, 1);
        let ctx = DeviceContext::create(&ns, DeviceType::Encoder, 1, record).unwrap();

        let full = AllocRequest {
            codec: Codec::H264,
            width: 1920,
            height: 1080,
            fps: 240,
        };
        assert_eq!(admit_pixels(&ctx, &full).unwrap(), full.pixel_rate());
        let err = admit_pixels(&ctx, &hd30()).unwrap_err();
        assert!(matches!(err, PoolError::CapacityExceeded { .. }));
        // Failed admission must not change the books.
        assert_eq!(
            ctx.snapshot().unwrap().xcode_load_pixel,
            full.pixel_rate()
        );

        drop(ctx);
        DeviceContext::destroy(&ns, DeviceType::Encoder, 1).unwrap();
    }
}
