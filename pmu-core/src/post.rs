//! Command poster
//!
//! `post_command` validates a command, reserves a sequence slot, stages any
//! payload into DMEM (or a framebuffer surface), writes the allocation
//! descriptors into the command body and pushes the frame into a command
//! queue. The descriptor it returns identifies the command until its
//! response has been processed.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error};
use pmu_proto::alloc::{FbDesc, PayloadAlloc};
use pmu_proto::pg::dma_idx;
use pmu_proto::{FirmwareAbi, HDR_SIZE, PmuHdr, ctrl_flags, unit};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::PmuContext;
use crate::error::PmuError;
use crate::platform::Platform;
use crate::queue::QueueId;
use crate::seq::{DmemBlock, OutLocation, SeqResources};

/// Completion callback, run once from message processing.
pub type Callback<P> = Box<dyn FnOnce(&PmuContext<P>, &Response<'_>) + Send>;

/// How the firmware answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    /// The firmware had no handler for the command (RC unit notification)
    Unhandled,
}

/// A response as seen by a callback.
#[derive(Debug)]
pub struct Response<'a> {
    /// Descriptor returned by `post_command`
    pub desc: u32,
    pub hdr: PmuHdr,
    /// Message body (header stripped)
    pub body: &'a [u8],
    pub status: ResponseStatus,
    /// Output payload read back from DMEM or the output surface
    pub out: Option<&'a [u8]>,
}

impl Response<'_> {
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Decode the body as `T`.
    pub fn decode<T: FromBytes + KnownLayout + Immutable>(&self) -> Result<T, PmuError> {
        T::read_from_prefix(self.body)
            .map(|(value, _)| value)
            .map_err(|_| PmuError::Abi(pmu_proto::AbiError::Truncated))
    }
}

/// Bytes sent to the firmware alongside a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadIn {
    pub data: Vec<u8>,
    /// Offset of the allocation descriptor in the command body
    pub offset: usize,
    /// Stage through a surface of this size instead of DMEM when non-zero
    pub fb_size: u32,
}

/// Space the firmware fills in for the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadOut {
    pub size: u32,
    /// Offset of the allocation descriptor in the command body
    pub offset: usize,
    pub fb_size: u32,
}

/// Payload of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub input: Option<PayloadIn>,
    pub output: Option<PayloadOut>,
    /// Output reuses the input region (sized to the larger of the two)
    pub in_place: bool,
}

impl Payload {
    /// DMEM-staged input described at `offset`.
    #[must_use]
    pub fn input(data: Vec<u8>, offset: usize) -> Self {
        Self {
            input: Some(PayloadIn {
                data,
                offset,
                fb_size: 0,
            }),
            ..Self::default()
        }
    }

    /// DMEM output region of `size` bytes described at `offset`.
    #[must_use]
    pub fn output(size: u32, offset: usize) -> Self {
        Self {
            output: Some(PayloadOut {
                size,
                offset,
                fb_size: 0,
            }),
            ..Self::default()
        }
    }
}

fn validate(
    abi: &dyn FirmwareAbi,
    unit_id: u8,
    body_len: usize,
    payload: Option<&Payload>,
    queue_size: u32,
) -> Result<(), PmuError> {
    let frame = HDR_SIZE + body_len;
    if frame > pmu_proto::hdr::MAX_FRAME_SIZE || frame > (queue_size / 2) as usize {
        return Err(PmuError::InvalidArgument);
    }
    if !unit::is_valid(unit_id) || unit_id == unit::REWIND {
        return Err(PmuError::InvalidArgument);
    }

    let Some(payload) = payload else {
        return Ok(());
    };
    if payload.input.is_none() && payload.output.is_none() {
        return Err(PmuError::InvalidArgument);
    }
    if payload.in_place && (payload.input.is_none() || payload.output.is_none()) {
        return Err(PmuError::InvalidArgument);
    }

    // Offset 0 would overwrite the sub-command id
    let fits = |offset: usize| offset != 0 && offset + abi.alloc_size() <= body_len;
    if let Some(input) = &payload.input {
        if input.data.is_empty() || !fits(input.offset) {
            return Err(PmuError::InvalidArgument);
        }
        if input.fb_size != 0 && !abi.supports_fb() {
            return Err(PmuError::InvalidArgument);
        }
    }
    if let Some(output) = &payload.output {
        if output.size == 0 || !fits(output.offset) {
            return Err(PmuError::InvalidArgument);
        }
        if output.fb_size != 0 && !abi.supports_fb() {
            return Err(PmuError::InvalidArgument);
        }
    }

    let in_len = payload.input.as_ref().map_or(0, |i| i.data.len());
    let out_len = payload.output.map_or(0, |o| o.size as usize);
    let dmem = if payload.in_place { in_len.max(out_len) } else { in_len };
    if dmem > usize::from(u16::MAX) || out_len > usize::from(u16::MAX) {
        return Err(PmuError::InvalidArgument);
    }
    Ok(())
}

impl<P: Platform> PmuContext<P> {
    /// Post a command and return its descriptor.
    ///
    /// `body` is the unit-specific body without the frame header. When a
    /// payload is given, its allocation descriptors are written into the
    /// body at the offsets it names. `callback` runs once when the response
    /// is processed, unless the command is cancelled first.
    pub fn post_command(
        &self,
        unit_id: u8,
        body: &[u8],
        payload: Option<Payload>,
        queue: QueueId,
        callback: Option<Callback<P>>,
    ) -> Result<u32, PmuError> {
        if !self.is_ready() {
            error!("cmd post: pmu not ready");
            return Err(PmuError::NotReady);
        }
        if !queue.is_command() {
            error!("cmd post: {queue:?} is not a command queue");
            return Err(PmuError::InvalidArgument);
        }
        let abi = self.abi()?;
        let ring = self.queue(queue).ring().ok_or(PmuError::NotReady)?;
        if let Err(e) = validate(abi, unit_id, body.len(), payload.as_ref(), ring.size()) {
            error!(
                "invalid pmu cmd: queue {:?} unit {:#x} size {} payload {}",
                queue,
                unit_id,
                body.len(),
                payload.is_some()
            );
            return Err(e);
        }

        let (seq_id, desc) = self.seq.lock().acquire()?;

        let mut frame = vec![0u8; HDR_SIZE + body.len()];
        frame[HDR_SIZE..].copy_from_slice(body);

        let mut res = SeqResources::default();
        if let Some(payload) = &payload
            && let Err(e) = self.stage_payload(abi, payload, &mut frame, &mut res)
        {
            self.seq.lock().release(seq_id);
            self.free_resources(res);
            return Err(e);
        }

        let hdr = PmuHdr {
            unit_id,
            size: frame.len() as u8,
            ctrl_flags: ctrl_flags::STATUS | ctrl_flags::INTR,
            seq_id,
        };
        frame[..HDR_SIZE].copy_from_slice(hdr.as_bytes());

        self.seq.lock().arm(seq_id, callback, res);

        if let Err(e) = self.write_frame(queue, &frame) {
            error!("cmd post: unit {unit_id:#x} seq {seq_id} not queued: {e}");
            let released = self.seq.lock().release(seq_id);
            if let Some(done) = released {
                self.free_resources(done.res);
            }
            return Err(e);
        }

        debug!("cmd post unit {unit_id:#x} seq {seq_id} desc {desc} on {queue:?}");
        Ok(desc)
    }

    fn write_frame(&self, queue: QueueId, frame: &[u8]) -> Result<(), PmuError> {
        let mut session = self.open_write(queue, frame.len() as u32)?;
        session.push(frame)?;
        session.close(true);
        Ok(())
    }

    fn stage_payload(
        &self,
        abi: &dyn FirmwareAbi,
        payload: &Payload,
        frame: &mut [u8],
        res: &mut SeqResources,
    ) -> Result<(), PmuError> {
        let out_size = payload.output.map_or(0, |o| o.size);

        if let Some(input) = &payload.input {
            let len = input.data.len() as u32;
            let size = if payload.in_place { len.max(out_size) } else { len };
            let offset = self.dmem_alloc.lock().alloc(size)?;
            res.in_dmem = Some(DmemBlock { offset, size });

            let fb = if input.fb_size != 0 {
                let surface = self.platform.alloc_surface(input.fb_size)?;
                res.in_surface = Some(surface);
                self.platform.write_surface(&surface, 0, &input.data);
                Some(FbDesc::new(surface.gpu_va, surface.size, dma_idx::VIRT))
            } else {
                self.dmem.write(&self.platform, offset, &input.data)?;
                None
            };

            let alloc = PayloadAlloc {
                dmem_size: size as u16,
                dmem_offset: offset,
                fb,
            };
            abi.encode_alloc(&alloc, &mut frame[HDR_SIZE + input.offset..])?;

            if payload.in_place
                && let Some(output) = &payload.output
            {
                abi.encode_alloc(&alloc, &mut frame[HDR_SIZE + output.offset..])?;
                res.out = Some(match res.in_surface {
                    Some(surface) => OutLocation::Surface {
                        surface,
                        len: out_size,
                    },
                    None => OutLocation::Dmem {
                        offset,
                        len: out_size,
                    },
                });
            }
        }

        if let Some(output) = &payload.output
            && !payload.in_place
        {
            let offset = self.dmem_alloc.lock().alloc(output.size)?;
            res.out_dmem = Some(DmemBlock {
                offset,
                size: output.size,
            });

            let fb = if output.fb_size != 0 {
                let surface = self.platform.alloc_surface(output.fb_size)?;
                res.out_surface = Some(surface);
                res.out = Some(OutLocation::Surface {
                    surface,
                    len: output.size,
                });
                Some(FbDesc::new(surface.gpu_va, surface.size, dma_idx::VIRT))
            } else {
                res.out = Some(OutLocation::Dmem {
                    offset,
                    len: output.size,
                });
                None
            };

            let alloc = PayloadAlloc {
                dmem_size: output.size as u16,
                dmem_offset: offset,
                fb,
            };
            abi.encode_alloc(&alloc, &mut frame[HDR_SIZE + output.offset..])?;
        }
        Ok(())
    }

    /// Return staged DMEM blocks and surfaces.
    pub(crate) fn free_resources(&self, res: SeqResources) {
        {
            let mut dmem = self.dmem_alloc.lock();
            for block in [res.in_dmem, res.out_dmem].into_iter().flatten() {
                dmem.free(block.offset, block.size);
            }
        }
        for surface in [res.in_surface, res.out_surface].into_iter().flatten() {
            self.platform.free_surface(surface);
        }
    }

    /// Read back the output payload of a completed command.
    pub(crate) fn read_output(&self, location: OutLocation) -> Result<Vec<u8>, PmuError> {
        match location {
            OutLocation::Dmem { offset, len } => {
                let mut out = vec![0u8; len as usize];
                self.dmem.read(&self.platform, offset, &mut out)?;
                Ok(out)
            }
            OutLocation::Surface { surface, len } => {
                let mut out = vec![0u8; len as usize];
                self.platform.read_surface(&surface, 0, &mut out);
                Ok(out)
            }
        }
    }

    /// Drop the callback of an in-flight command.
    ///
    /// The response is still consumed and the staged memory freed when it
    /// arrives.
    pub fn cancel(&self, desc: u32) -> Result<(), PmuError> {
        let callback = self.seq.lock().cancel(desc)?;
        drop(callback);
        debug!("cmd desc {desc} cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ECHO_UNIT, SimFalcon, booted, echo_body, pump};
    use crate::mutex::MutexId;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use pmu_proto::abi::app_version;
    use std::thread;

    fn counter() -> (Arc<AtomicU32>, Callback<SimFalcon>) {
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (hits, cb)
    }

    #[test]
    fn test_validation() {
        let ctx = booted(SimFalcon::new());
        let body = [0u8; 8];
        assert_eq!(
            ctx.post_command(unit::PG, &body, None, QueueId::Message, None),
            Err(PmuError::InvalidArgument)
        );
        assert_eq!(
            ctx.post_command(0x80, &body, None, QueueId::Hpq, None),
            Err(PmuError::InvalidArgument)
        );
        // Larger than half the queue
        let big = [0u8; 200];
        assert_eq!(
            ctx.post_command(unit::PG, &big, None, QueueId::Lpq, None),
            Err(PmuError::InvalidArgument)
        );
        // Descriptor does not fit in the body
        let payload = Payload::input(vec![1, 2, 3, 4], 4);
        assert_eq!(
            ctx.post_command(unit::PG, &body, Some(payload), QueueId::Lpq, None),
            Err(PmuError::InvalidArgument)
        );
        // Empty payload
        assert_eq!(
            ctx.post_command(unit::PG, &body, Some(Payload::default()), QueueId::Lpq, None),
            Err(PmuError::InvalidArgument)
        );
        // Surfaces need the v3 layout
        let mut payload = Payload::input(vec![1, 2, 3, 4], 4);
        if let Some(input) = payload.input.as_mut() {
            input.fb_size = 0x100;
        }
        let body = [0u8; 16];
        assert_eq!(
            ctx.post_command(unit::PG, &body, Some(payload), QueueId::Lpq, None),
            Err(PmuError::InvalidArgument)
        );
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_not_ready_before_init() {
        let ctx = PmuContext::new(SimFalcon::new(), crate::PmuConfig::new());
        assert_eq!(
            ctx.post_command(unit::PG, &[0; 4], None, QueueId::Hpq, None),
            Err(PmuError::NotReady)
        );
    }

    #[test]
    fn test_callback_runs_once_with_desc() {
        let ctx = booted(SimFalcon::new());
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let got = seen.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
            assert!(resp.is_ok());
            got.store(resp.desc, Ordering::SeqCst);
        });

        let desc = ctx
            .post_command(ECHO_UNIT, &echo_body(&ctx), None, QueueId::Lpq, Some(cb))
            .unwrap();
        assert_eq!(ctx.in_flight(), 1);
        pump(&ctx);
        assert_eq!(seen.load(Ordering::SeqCst), desc);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_echo_payload_round_trip_frees_dmem() {
        let ctx = booted(SimFalcon::new());
        let free_before = ctx.dmem_available();
        let out = Arc::new(spin::Mutex::new(Vec::new()));
        let sink = out.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
            *sink.lock() = resp.out.map(<[u8]>::to_vec).unwrap_or_default();
        });

        let body = echo_body(&ctx);
        let (in_at, out_at) = crate::sim::echo_offsets(&ctx);
        let payload = Payload {
            input: Some(PayloadIn {
                data: vec![9, 8, 7, 6, 5],
                offset: in_at,
                fb_size: 0,
            }),
            output: Some(PayloadOut {
                size: 5,
                offset: out_at,
                fb_size: 0,
            }),
            in_place: false,
        };
        ctx.post_command(ECHO_UNIT, &body, Some(payload), QueueId::Lpq, Some(cb))
            .unwrap();
        assert!(ctx.dmem_available() < free_before);
        pump(&ctx);

        assert_eq!(*out.lock(), vec![9, 8, 7, 6, 5]);
        assert_eq!(ctx.dmem_available(), free_before);
    }

    #[test]
    fn test_surface_payload_on_v3() {
        let ctx = booted(SimFalcon::with_version(app_version::GM206));
        let out = Arc::new(spin::Mutex::new(Vec::new()));
        let sink = out.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
            *sink.lock() = resp.out.map(<[u8]>::to_vec).unwrap_or_default();
        });

        let body = echo_body(&ctx);
        let (in_at, out_at) = crate::sim::echo_offsets(&ctx);
        let payload = Payload {
            input: Some(PayloadIn {
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
                offset: in_at,
                fb_size: 0x1000,
            }),
            output: Some(PayloadOut {
                size: 8,
                offset: out_at,
                fb_size: 0,
            }),
            in_place: true,
        };
        ctx.post_command(ECHO_UNIT, &body, Some(payload), QueueId::Hpq, Some(cb))
            .unwrap();
        assert_eq!(ctx.platform().surfaces_live(), 1);
        pump(&ctx);

        // In place over a surface: the firmware echoed into the same bytes
        assert_eq!(*out.lock(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ctx.platform().surfaces_live(), 0);
    }

    #[test]
    fn test_sequence_exhaustion_and_exclusivity() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let body = [0u8; 4];

        let mut descs = Vec::new();
        for i in 0..crate::config::MAX_SEQUENCES {
            let queue = if i % 2 == 0 { QueueId::Hpq } else { QueueId::Lpq };
            descs.push(ctx.post_command(ECHO_UNIT, &body, None, queue, None).unwrap());
        }
        assert_eq!(
            ctx.post_command(ECHO_UNIT, &body, None, QueueId::Lpq, None),
            Err(PmuError::NoFreeSequence)
        );

        let mut unique = descs.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), descs.len());

        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        pump(&ctx);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_posts_complete_exactly_once() {
        const WORKERS: usize = 4;
        const PER_WORKER: usize = 40;

        let ctx = booted(SimFalcon::new());
        let completed = Arc::new(spin::Mutex::new(Vec::new()));
        let stop = AtomicBool::new(false);

        let mut posted: Vec<u32> = thread::scope(|s| {
            let isr = s.spawn(|| {
                while !stop.load(Ordering::Acquire) {
                    ctx.service_interrupt();
                    thread::yield_now();
                }
            });

            let workers: Vec<_> = (0..WORKERS)
                .map(|w| {
                    let ctx = &ctx;
                    let completed = completed.clone();
                    s.spawn(move || {
                        let mut descs = Vec::new();
                        for i in 0..PER_WORKER {
                            let queue = if (w + i) % 2 == 0 { QueueId::Hpq } else { QueueId::Lpq };
                            loop {
                                let sink = completed.clone();
                                let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
                                    sink.lock().push(resp.desc);
                                });
                                match ctx.post_command(ECHO_UNIT, &[0; 4], None, queue, Some(cb)) {
                                    Ok(desc) => {
                                        descs.push(desc);
                                        break;
                                    }
                                    Err(PmuError::NoFreeSequence | PmuError::QueueFull | PmuError::Busy) => {
                                        thread::yield_now();
                                    }
                                    Err(e) => panic!("post failed: {e}"),
                                }
                            }
                        }
                        descs
                    })
                })
                .collect();

            let posted = workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect();
            stop.store(true, Ordering::Release);
            isr.join().unwrap();
            posted
        });
        pump(&ctx);

        let mut completed = completed.lock().clone();
        assert_eq!(posted.len(), WORKERS * PER_WORKER);
        posted.sort_unstable();
        completed.sort_unstable();
        assert_eq!(completed, posted);
        posted.dedup();
        assert_eq!(posted.len(), WORKERS * PER_WORKER);

        assert_eq!(ctx.in_flight(), 0);
        assert_eq!(ctx.platform().commands_seen(ECHO_UNIT), WORKERS * PER_WORKER);
        assert_eq!(ctx.mutexes.ref_count(MutexId::HPQ), 0);
        assert_eq!(ctx.platform().mutex_value(MutexId::HPQ.index()), 0);
        assert_eq!(ctx.platform().tokens_outstanding(), 0);
    }

    #[test]
    fn test_queue_full_releases_slot_and_dmem() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let free_before = ctx.dmem_available();
        let body = echo_body(&ctx);
        let (in_at, _) = crate::sim::echo_offsets(&ctx);

        let mut err = None;
        for _ in 0..64 {
            let payload = Payload::input(vec![0xab; 16], in_at);
            if let Err(e) = ctx.post_command(ECHO_UNIT, &body, Some(payload), QueueId::Lpq, None) {
                err = Some(e);
                break;
            }
        }
        assert_eq!(err, Some(PmuError::QueueFull));
        let queued = ctx.in_flight();

        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        pump(&ctx);
        assert_eq!(queued, ctx.platform().commands_seen(ECHO_UNIT));
        assert_eq!(ctx.in_flight(), 0);
        assert_eq!(ctx.dmem_available(), free_before);
    }

    #[test]
    fn test_cancel_suppresses_callback() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let (hits, cb) = counter();
        let desc = ctx
            .post_command(ECHO_UNIT, &echo_body(&ctx), None, QueueId::Lpq, Some(cb))
            .unwrap();

        ctx.cancel(desc).unwrap();
        assert_eq!(ctx.cancel(desc), Err(PmuError::InvalidArgument));

        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        pump(&ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_unhandled_command_reaches_callback() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().reject_next();
        let status = Arc::new(spin::Mutex::new(None));
        let sink = status.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
            *sink.lock() = Some(resp.status);
        });

        ctx.post_command(ECHO_UNIT, &echo_body(&ctx), None, QueueId::Hpq, Some(cb))
            .unwrap();
        pump(&ctx);
        assert_eq!(*status.lock(), Some(ResponseStatus::Unhandled));
        assert_eq!(ctx.in_flight(), 0);
    }
}
