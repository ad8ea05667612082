// MIT License - Copyright (c) 2026 Peter Wright
// Protocol constants and timing limits

use std::time::Duration;

/// How long `connect()` waits for a CONNACK.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect()` waits for the DISCONNECT packet to be flushed.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long discovery waits for each `bridge/devices` / `bridge/groups` snapshot.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Set-and-verify: attempts, and wait per attempt for the device to echo its state.
pub const VERIFY_ATTEMPTS: usize = 3;
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness probe: `get` requests per device before it is declared unresponsive.
pub const PROBE_ATTEMPTS: usize = 24;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Group membership probe: group-wide `get` rounds.
pub const GROUP_PROBE_ROUNDS: usize = 120;

/// Bridge request/response correlation.
pub const BRIDGE_ATTEMPTS: usize = 3;
pub const BRIDGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Transaction ids are drawn from this inclusive range.
pub const TRANSACTION_MIN: u32 = 1000;
pub const TRANSACTION_MAX: u32 = 9999;

/// zigbee2mqtt expresses transition times in tenths of a second.
pub const TRANSTIME_SCALE: u32 = 10;

/// Zigbee cluster commands used for the logical lighting properties.
pub const LEVEL_CLUSTER: &str = "genLevelCtrl";
pub const LEVEL_COMMAND: &str = "moveToLevel";
pub const COLOR_CLUSTER: &str = "lightingColorCtrl";
pub const COLOR_TEMP_COMMAND: &str = "moveToColorTemp";

/// Switch firmware setting toggled around a hard reset.
pub const SMART_BULB_MODE: &str = "smartBulbMode";
pub const SMART_BULB_MODE_DISABLED: &str = "Disabled";
pub const SMART_BULB_MODE_ENABLED: &str = "Smart Bulb Mode";

/// Orchestrator cadence, in minutes past the hour.
pub const LIGHTING_INTERVAL_MINUTES: u32 = 5;
pub const HEALTH_INTERVAL_MINUTES: u32 = 15;

/// Transition used by the periodic lighting task, and after a repair.
pub const LIGHTING_TRANSITION_SECS: u32 = 30;
pub const REPAIR_TRANSITION_SECS: u32 = 1;

/// Health checks do not run between these local times.
pub const QUIET_HOURS_START: (u32, u32) = (18, 0);
pub const QUIET_HOURS_END: (u32, u32) = (8, 0);

/// Hard reset of a circuit through its hardwired switches.
pub const RESET_CYCLES: usize = 4;
pub const REJOIN_ATTEMPTS: usize = 3;
pub const POWER_SETTLE: Duration = Duration::from_secs(2);
pub const PERMIT_JOIN_SECS: u32 = 120;
