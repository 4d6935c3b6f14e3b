//! Message processing
//!
//! Drains the message queue: the init message first (read directly at the
//! queue tail, before the queue geometry is known), then responses, matched
//! to their sequence slot, and unsolicited events, routed by unit.

use alloc::vec;
use alloc::vec::Vec;

use log::{debug, error, info, trace, warn};
use pmu_mmio::{RingCursor, read_barrier};
use pmu_proto::event::{ThermHwSlowdown, rc, therm};
use pmu_proto::init::{MSG_TYPE_PMU_INIT, SHA1_GID_SIGNATURE, SHA1_GID_SIZE};
use pmu_proto::{HDR_SIZE, PmuHdr, unit};
use zerocopy::FromBytes;

use crate::PmuContext;
use crate::error::PmuError;
use crate::pg::PmuState;
use crate::platform::{Platform, PmuEvent};
use crate::post::{Response, ResponseStatus};
use crate::queue::QueueId;
use crate::seq::SeqState;

/// A frame read from the message queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub hdr: PmuHdr,
    pub body: Vec<u8>,
}

impl<P: Platform> PmuContext<P> {
    /// Consume the firmware's first message and configure the queues.
    pub(crate) fn process_init_message(&self) -> Result<(), PmuError> {
        let abi = self.abi()?;
        let tail = self.platform.read32(crate::regs::MSGQ_TAIL);
        read_barrier();

        let mut raw = [0u8; HDR_SIZE];
        self.dmem.read(&self.platform, tail, &mut raw)?;
        let (hdr, _) = PmuHdr::read_from_prefix(&raw[..]).map_err(|_| PmuError::Protocol)?;
        if hdr.unit_id != unit::INIT {
            error!("expecting init msg, got unit {:#x}", hdr.unit_id);
            return Err(PmuError::Protocol);
        }
        let body_len = hdr.body_len().filter(|&len| len > 0).ok_or(PmuError::Protocol)?;

        let mut body = vec![0u8; body_len];
        self.dmem.read(&self.platform, tail + HDR_SIZE as u32, &mut body)?;
        if body[0] != MSG_TYPE_PMU_INIT {
            error!("expecting init msg, got type {:#x}", body[0]);
            return Err(PmuError::Protocol);
        }
        let info = abi.decode_init(&body)?;

        self.platform.write32(
            crate::regs::MSGQ_TAIL,
            RingCursor::advance(tail, u32::from(hdr.size)),
        );

        self.read_gid(info.sw_managed_offset);

        self.queue(QueueId::Hpq).configure(&info.hpq)?;
        self.queue(QueueId::Lpq).configure(&info.lpq)?;
        self.queue(QueueId::Message).configure(&info.msgq)?;
        self.dmem_alloc
            .lock()
            .reset(info.sw_managed_offset, info.sw_managed_size);

        info!(
            "pmu init: abi {}, dmem window {:#x}+{:#x}",
            abi.version(),
            info.sw_managed_offset,
            info.sw_managed_size
        );

        self.pmu_ready.store(true, core::sync::atomic::Ordering::Release);
        self.set_state(PmuState::InitReceived);
        self.schedule_pg_work();
        Ok(())
    }

    fn read_gid(&self, offset: u32) {
        let mut raw = [0u8; 4 + SHA1_GID_SIZE];
        if self.dmem.read(&self.platform, offset, &mut raw).is_err() {
            return;
        }
        let signature = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut gid = self.gid.lock();
        if signature == SHA1_GID_SIGNATURE {
            let mut id = [0u8; SHA1_GID_SIZE];
            id.copy_from_slice(&raw[4..]);
            debug!("pmu firmware gid {:02x?}", &id[..4]);
            *gid = Some(id);
        } else {
            debug!("pmu firmware carries no gid");
            *gid = None;
        }
    }

    /// Read one message, following a rewind marker if one is at the tail.
    ///
    /// Returns `Ok(None)` when the queue is empty. Frames for an unknown
    /// unit are consumed and dropped. If a frame cannot be delimited the
    /// tail is left where it was and an error is returned.
    pub(crate) fn read_message(&self) -> Result<Option<Message>, PmuError> {
        loop {
            if self.queue_is_empty(QueueId::Message) {
                return Ok(None);
            }
            let mut session = self.open_read(QueueId::Message)?;

            let mut raw = [0u8; HDR_SIZE];
            if session.pop(&mut raw)? != HDR_SIZE {
                error!("fail to read msg header at {:#x}", session.position());
                return Err(PmuError::Protocol);
            }
            let (mut hdr, _) =
                PmuHdr::read_from_prefix(&raw[..]).map_err(|_| PmuError::Protocol)?;

            if hdr.unit_id == unit::REWIND {
                session.rewind()?;
                if session.pop(&mut raw)? != HDR_SIZE {
                    error!("fail to read msg header after rewind");
                    return Err(PmuError::Protocol);
                }
                (hdr, _) = PmuHdr::read_from_prefix(&raw[..]).map_err(|_| PmuError::Protocol)?;
            }

            let body_len = hdr.body_len().ok_or_else(|| {
                error!("msg size {} below header", hdr.size);
                PmuError::Protocol
            })?;

            let mut body = vec![0u8; body_len];
            if body_len > 0 && session.pop(&mut body)? != body_len {
                error!("fail to read msg body, unit {:#x} size {}", hdr.unit_id, hdr.size);
                return Err(PmuError::Protocol);
            }
            session.close(true);

            if !unit::is_valid(hdr.unit_id) || hdr.unit_id == unit::REWIND {
                error!(
                    "read invalid unit_id {:#x}, dropping {} byte msg",
                    hdr.unit_id, hdr.size
                );
                continue;
            }
            return Ok(Some(Message { hdr, body }));
        }
    }

    /// Drain the message queue, dispatching every message.
    pub(crate) fn process_messages(&self) {
        if !self.is_ready() {
            if let Err(e) = self.process_init_message() {
                error!("pmu init message: {e}");
                return;
            }
            if self.config.perfmon_sampling
                && let Err(e) = self.perfmon_init()
            {
                warn!("perfmon init: {e}");
            }
            return;
        }

        loop {
            match self.read_message() {
                Ok(Some(msg)) => {
                    trace!(
                        "msg unit {:#x} size {} flags {:#x} seq {}",
                        msg.hdr.unit_id, msg.hdr.size, msg.hdr.ctrl_flags, msg.hdr.seq_id
                    );
                    if msg.hdr.is_event() {
                        self.handle_event(&msg);
                    } else {
                        self.handle_response(&msg);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("failed to read pmu message: {e}");
                    break;
                }
            }
        }
    }

    fn handle_response(&self, msg: &Message) {
        let seq_id = msg.hdr.seq_id;
        let state = self.seq.lock().state(seq_id);
        let Some(done) = self.seq.lock().complete(seq_id) else {
            error!("msg for an unknown sequence {seq_id} ({state:?})");
            return;
        };

        let status = if msg.hdr.unit_id == unit::RC
            && msg.body.first() == Some(&rc::MSG_TYPE_UNHANDLED_CMD)
        {
            error!("unhandled cmd: seq {seq_id}");
            ResponseStatus::Unhandled
        } else {
            ResponseStatus::Ok
        };

        let out = match (status, done.state, done.res.out) {
            (ResponseStatus::Ok, SeqState::Used, Some(location)) => {
                match self.read_output(location) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        error!("seq {seq_id}: failed to read output payload: {e}");
                        None
                    }
                }
            }
            _ => None,
        };
        self.free_resources(done.res);

        if let Some(callback) = done.callback {
            let response = Response {
                desc: done.desc,
                hdr: msg.hdr,
                body: &msg.body,
                status,
                out: out.as_deref(),
            };
            callback(self, &response);
        }
    }

    fn handle_event(&self, msg: &Message) {
        match msg.hdr.unit_id {
            unit::PERFMON | unit::PERFMON_T18X => self.handle_perfmon_event(&msg.body),
            unit::PERF => self.platform.notify(PmuEvent::Perf {
                body: msg.body.clone(),
            }),
            unit::THERM => self.handle_therm_event(&msg.body),
            other => debug!("ignoring event for unit {other:#x}"),
        }
    }

    fn handle_therm_event(&self, body: &[u8]) {
        let Ok((event, _)) = ThermHwSlowdown::read_from_prefix(body) else {
            warn!("short therm event ({} bytes)", body.len());
            return;
        };
        if event.msg_type != therm::MSG_ID_EVENT_HW_SLOWDOWN_NOTIFICATION {
            debug!("unknown therm event {:#x}", event.msg_type);
            return;
        }
        if event.mask == 1 << therm::EVENT_THERMAL_1 {
            warn!("thermal alert: hw slowdown mask {:#x}", event.mask);
            self.platform.notify(PmuEvent::ThermalAlarm { mask: event.mask });
        } else {
            debug!("unhandled hw slowdown mask {:#x}", event.mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::Callback;
    use crate::sim::{ECHO_UNIT, SimFalcon, booted, pump};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};
    use pmu_proto::ctrl_flags;
    use zerocopy::IntoBytes;

    #[test]
    fn test_unknown_sequence_does_not_stall_queue() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        ctx.post_command(ECHO_UNIT, &[0; 4], None, QueueId::Lpq, Some(cb))
            .unwrap();

        // A stray response for a slot nobody owns, ahead of the real one
        ctx.platform().inject_message(ECHO_UNIT, 0, 31, &[0; 4]);
        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        pump(&ctx);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ctx.queue_is_empty(QueueId::Message));
    }

    #[test]
    fn test_message_after_rewind_marker() {
        let ctx = booted(SimFalcon::new());
        let ring = ctx.queue(QueueId::Message).ring().unwrap();
        // Leave 8 bytes before the wrap so the next 12-byte message rewinds
        ctx.platform().set_message_cursors(ring.end() - 8);

        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, resp| {
            assert_eq!(resp.body.len(), 8);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        ctx.post_command(ECHO_UNIT, &[0; 8], None, QueueId::Lpq, Some(cb))
            .unwrap();
        pump(&ctx);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.platform().msgq_tail(), ring.offset() + 12);
    }

    #[test]
    fn test_therm_alarm_is_forwarded() {
        let ctx = booted(SimFalcon::new());
        let alarm = ThermHwSlowdown {
            msg_type: therm::MSG_ID_EVENT_HW_SLOWDOWN_NOTIFICATION,
            pad: [0; 3],
            mask: 1 << therm::EVENT_THERMAL_1,
        };
        ctx.platform().inject_message(unit::THERM, ctrl_flags::EVENT, 0, alarm.as_bytes());
        let other = ThermHwSlowdown { mask: 1 << 3, ..alarm };
        ctx.platform().inject_message(unit::THERM, ctrl_flags::EVENT, 0, other.as_bytes());
        ctx.platform().inject_message(unit::PERF, ctrl_flags::EVENT | 0x20, 0, &[7, 0, 0, 0]);
        pump(&ctx);

        assert_eq!(
            ctx.platform().events(),
            vec![
                PmuEvent::ThermalAlarm { mask: 2 },
                PmuEvent::Perf { body: vec![7, 0, 0, 0] },
            ]
        );
    }

    #[test]
    fn test_invalid_unit_is_dropped_and_queue_keeps_moving() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().set_firmware_paused(true);
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        let cb: Callback<SimFalcon> = Box::new(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        ctx.post_command(ECHO_UNIT, &[0; 4], None, QueueId::Lpq, Some(cb))
            .unwrap();

        // A frame for a unit nobody knows sits ahead of the real response
        ctx.platform().inject_raw_frame(
            PmuHdr {
                unit_id: 0x80,
                size: 8,
                ctrl_flags: 0,
                seq_id: 0,
            },
            &[0; 4],
        );
        ctx.platform().set_firmware_paused(false);
        ctx.platform().kick_firmware();
        pump(&ctx);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.in_flight(), 0);
        assert!(ctx.queue_is_empty(QueueId::Message));
    }

    #[test]
    fn test_short_frame_is_not_consumed() {
        let ctx = booted(SimFalcon::new());
        ctx.platform().inject_raw_frame(
            PmuHdr {
                unit_id: unit::PG,
                size: 2,
                ctrl_flags: 0,
                seq_id: 0,
            },
            &[],
        );
        assert!(matches!(ctx.read_message(), Err(PmuError::Protocol)));
        assert!(!ctx.queue_is_empty(QueueId::Message));
    }
}
