//! Adaptive power (AELPG)
//!
//! The firmware tunes the ELPG idle filter per controller from observed idle
//! periods. The host only initialises the feature and enables, disables or
//! kicks individual controllers.

use alloc::boxed::Box;
use alloc::vec::Vec;

use log::{debug, error};
use pmu_proto::pg::{
    ApCtrl, ApCtrlInitParams, ApInit, ApInitAndEnableCtrl, ApKickCtrl, ApMsg, ap_cmd, ap_msg,
    cmd_id,
};
use pmu_proto::unit;
use zerocopy::IntoBytes;

use crate::PmuContext;
use crate::config::AelpgParams;
use crate::error::PmuError;
use crate::platform::Platform;
use crate::post::Callback;
use crate::queue::QueueId;

/// Adaptive power commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApCommand {
    Init { sampling_period_us: u32 },
    InitAndEnableCtrl { ctrl_id: u8, params: ApCtrlInitParams },
    EnableCtrl { ctrl_id: u8 },
    DisableCtrl { ctrl_id: u8 },
    KickCtrl { ctrl_id: u8, skip_count: u32 },
}

impl ApCommand {
    fn name(&self) -> &'static str {
        match self {
            ApCommand::Init { .. } => "INIT",
            ApCommand::InitAndEnableCtrl { .. } => "INIT_AND_ENABLE_CTRL",
            ApCommand::EnableCtrl { .. } => "ENABLE_CTRL",
            ApCommand::DisableCtrl { .. } => "DISABLE_CTRL",
            ApCommand::KickCtrl { .. } => "KICK_CTRL",
        }
    }

    fn encode(&self) -> Vec<u8> {
        let ctrl = |id: u8, ctrl_id: u8| ApCtrl {
            cmd_type: cmd_id::AP,
            cmd_id: id,
            ctrl_id,
            pad: 0,
        };
        match *self {
            ApCommand::Init { sampling_period_us } => ApInit {
                cmd_type: cmd_id::AP,
                cmd_id: ap_cmd::INIT,
                pad: [0; 2],
                pg_sampling_period_us: sampling_period_us,
            }
            .as_bytes()
            .to_vec(),
            ApCommand::InitAndEnableCtrl { ctrl_id, params } => ApInitAndEnableCtrl {
                cmd_type: cmd_id::AP,
                cmd_id: ap_cmd::INIT_AND_ENABLE_CTRL,
                ctrl_id,
                pad: 0,
                params,
            }
            .as_bytes()
            .to_vec(),
            ApCommand::EnableCtrl { ctrl_id } => {
                ctrl(ap_cmd::ENABLE_CTRL, ctrl_id).as_bytes().to_vec()
            }
            ApCommand::DisableCtrl { ctrl_id } => {
                ctrl(ap_cmd::DISABLE_CTRL, ctrl_id).as_bytes().to_vec()
            }
            ApCommand::KickCtrl {
                ctrl_id,
                skip_count,
            } => ApKickCtrl {
                cmd_type: cmd_id::AP,
                cmd_id: ap_cmd::KICK_CTRL,
                ctrl_id,
                pad: 0,
                skip_count,
            }
            .as_bytes()
            .to_vec(),
        }
    }
}

impl From<&AelpgParams> for ApCtrlInitParams {
    fn from(params: &AelpgParams) -> Self {
        Self {
            min_idle_filter_us: params.min_idle_filter_us,
            min_target_saving_us: params.min_target_saving_us,
            power_break_even_us: params.power_break_even_us,
            cycles_per_sample_max: params.cycles_per_sample_max,
        }
    }
}

impl<P: Platform> PmuContext<P> {
    /// Post an adaptive power command on the high-priority queue.
    pub fn ap_send(&self, cmd: ApCommand) -> Result<u32, PmuError> {
        let body = cmd.encode();
        let callback = match cmd {
            ApCommand::InitAndEnableCtrl { .. } => {
                let on_ack: Callback<P> = Box::new(|_, resp| {
                    if !resp.is_ok() {
                        error!("AP cmd aborted");
                        return;
                    }
                    match resp.decode::<ApMsg>() {
                        Ok(msg) if msg.msg_id == ap_msg::INIT_ACK => {
                            debug!("AELPG ctrl {} initialised", msg.ctrl_id);
                        }
                        Ok(msg) => error!("unsupported AP message {:#x}", msg.msg_id),
                        Err(e) => error!("bad AP message: {e}"),
                    }
                });
                Some(on_ack)
            }
            _ => None,
        };
        debug!("cmd post AP {}", cmd.name());
        self.post_command(unit::PG, &body, None, QueueId::Hpq, callback)
    }

    /// Global adaptive power initialisation with the configured sampling period.
    pub fn aelpg_init(&self) -> Result<u32, PmuError> {
        self.ap_send(ApCommand::Init {
            sampling_period_us: self.config.aelpg_params.sampling_period_us,
        })
    }

    /// Initialise and enable controller `ctrl_id` with the configured tuning.
    pub fn aelpg_init_and_enable(&self, ctrl_id: u8) -> Result<u32, PmuError> {
        self.ap_send(ApCommand::InitAndEnableCtrl {
            ctrl_id,
            params: ApCtrlInitParams::from(&self.config.aelpg_params),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PmuConfig;
    use crate::sim::{SimFalcon, booted, booted_with, pump};
    use pmu_proto::pg::ap_ctrl;

    #[test]
    fn test_bootstrap_initialises_aelpg_when_configured() {
        let config = PmuConfig {
            aelpg_enabled: true,
            ..PmuConfig::new()
        };
        let ctx = booted_with(SimFalcon::new(), config);
        assert_eq!(
            ctx.platform().ap_commands(),
            alloc::vec![(ap_cmd::INIT, 0), (ap_cmd::INIT_AND_ENABLE_CTRL, ap_ctrl::GRAPHICS)]
        );
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_ctrl_commands() {
        let ctx = booted(SimFalcon::new());
        assert!(ctx.platform().ap_commands().is_empty());

        ctx.ap_send(ApCommand::DisableCtrl { ctrl_id: ap_ctrl::MS }).unwrap();
        ctx.ap_send(ApCommand::KickCtrl {
            ctrl_id: ap_ctrl::GRAPHICS,
            skip_count: 2,
        })
        .unwrap();
        pump(&ctx);
        assert_eq!(
            ctx.platform().ap_commands(),
            alloc::vec![(ap_cmd::DISABLE_CTRL, ap_ctrl::MS), (ap_cmd::KICK_CTRL, ap_ctrl::GRAPHICS)]
        );
        assert_eq!(ctx.in_flight(), 0);
    }

    #[test]
    fn test_encoding() {
        let body = ApCommand::Init {
            sampling_period_us: 0x0102_0304,
        }
        .encode();
        assert_eq!(body, [cmd_id::AP, ap_cmd::INIT, 0, 0, 4, 3, 2, 1]);

        let params = ApCtrlInitParams::from(&AelpgParams::new());
        let body = ApCommand::InitAndEnableCtrl { ctrl_id: 1, params }.encode();
        assert_eq!(body.len(), 20);
        assert_eq!(&body[4..8], &100u32.to_le_bytes());
    }
}
