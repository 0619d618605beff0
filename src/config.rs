/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator.

use std::time::Duration;

use crate::pbft::messages::MessageKind;

/// Operator-tunable parameters of a replica. Construct with [`Configuration::default`] and adjust
/// the fields that matter for the deployment.
#[derive(Clone)]
pub struct Configuration {
    /// Base view timeout. The effective timeout backs off as `view_timeout * 1.5^change_cycle`
    /// while view changes fail to complete.
    pub view_timeout: Duration,

    /// Saturation point for the timeout back-off exponent.
    pub max_change_cycle: u32,

    /// If set, a proposal that executes to zero user transactions triggers a view change instead
    /// of being voted through.
    pub omit_empty_block: bool,

    /// Messages whose height is more than this many blocks behind the chain tip are not
    /// rebroadcast to other peers.
    pub rebroadcast_height_window: u64,

    /// If set, messages older than this are additionally excluded from rebroadcast. Disabled by
    /// default: the filter compares sender clocks against ours, and skew between nodes made it
    /// drop legitimate traffic in production.
    pub rebroadcast_time_window: Option<Duration>,

    /// Minimum interval between garbage-collection sweeps over the vote caches.
    pub collect_interval: Duration,

    /// Capacities of the per-peer seen filters.
    pub seen_filter_capacities: SeenFilterCapacities,

    /// Enables the default event-logging handlers.
    pub log_events: bool,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            view_timeout: Duration::from_secs(3),
            max_change_cycle: 20,
            omit_empty_block: false,
            rebroadcast_height_window: 10,
            rebroadcast_time_window: None,
            collect_interval: Duration::from_secs(60),
            seen_filter_capacities: SeenFilterCapacities::default(),
            log_events: true,
        }
    }
}

/// Bounds on the per-peer, per-kind seen filters. On overflow the oldest fingerprint is evicted.
#[derive(Clone, Copy)]
pub struct SeenFilterCapacities {
    pub prepare: usize,
    pub sign: usize,
    pub commit: usize,
    pub view_change: usize,
}

impl SeenFilterCapacities {
    pub(crate) fn for_kind(&self, kind: MessageKind) -> usize {
        match kind {
            MessageKind::Prepare => self.prepare,
            MessageKind::Sign => self.sign,
            MessageKind::Commit => self.commit,
            MessageKind::ViewChange => self.view_change,
        }
    }
}

impl Default for SeenFilterCapacities {
    fn default() -> SeenFilterCapacities {
        SeenFilterCapacities {
            prepare: 1024,
            sign: 2048,
            commit: 2048,
            view_change: 1024,
        }
    }
}
