//! Process-wide device/session presence registry.
//!
//! Sessions are marked online on transport accept and offline on close;
//! heartbeat frames and MQTT status topics refresh device-level state. A
//! device is online while any of its sessions is.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

/// Heartbeat metrics reported by a device.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMetrics {
    pub timestamp: i64,
    pub battery: f64,
    pub temp: f64,
    pub net: String,
    pub rssi: i32,
}

/// Per-session presence record.
#[derive(Debug, Clone)]
pub struct SessionPresence {
    pub session_id: String,
    pub online: bool,
    pub last_active: DateTime<Utc>,
}

/// Per-device presence record, aggregating its sessions.
#[derive(Debug, Clone, Default)]
pub struct DevicePresence {
    pub device_id: String,
    pub online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_conn_event: Option<DateTime<Utc>>,
    pub metrics: HeartbeatMetrics,
    pub sessions: HashMap<String, SessionPresence>,
}

/// Registry of device and session online state.
pub struct PresenceManager {
    devices: RwLock<HashMap<String, DevicePresence>>,
}

static PRESENCE: Lazy<PresenceManager> = Lazy::new(|| PresenceManager {
    devices: RwLock::new(HashMap::new()),
});

/// The process-wide presence manager.
pub fn presence_manager() -> &'static PresenceManager {
    &PRESENCE
}

impl PresenceManager {
    fn with_device<F: FnOnce(&mut DevicePresence)>(&self, device_id: &str, f: F) {
        let mut devices = self.devices.write().unwrap();
        let entry = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DevicePresence {
                device_id: device_id.to_string(),
                ..Default::default()
            });
        f(entry);
    }

    /// Mark a session online, bringing the device online with it.
    pub fn set_session_online(&self, device_id: &str, session_id: &str) {
        self.with_device(device_id, |dev| {
            let sess = dev
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionPresence {
                    session_id: session_id.to_string(),
                    online: false,
                    last_active: Utc::now(),
                });
            sess.online = true;
            sess.last_active = Utc::now();
            dev.online = true;
            dev.last_conn_event = Some(Utc::now());
        });
    }

    /// Mark a session offline; the device goes offline when no session is
    /// left online.
    pub fn set_session_offline(&self, device_id: &str, session_id: &str) {
        self.with_device(device_id, |dev| {
            if let Some(sess) = dev.sessions.get_mut(session_id) {
                sess.online = false;
                sess.last_active = Utc::now();
            }
            dev.online = dev.sessions.values().any(|s| s.online);
            dev.last_conn_event = Some(Utc::now());
        });
    }

    /// Refresh a session's last-active timestamp.
    pub fn touch_session(&self, device_id: &str, session_id: &str) {
        self.with_device(device_id, |dev| {
            if let Some(sess) = dev.sessions.get_mut(session_id) {
                sess.last_active = Utc::now();
            }
        });
    }

    /// Record heartbeat metrics for a device.
    pub fn update_heartbeat(&self, device_id: &str, metrics: HeartbeatMetrics) {
        self.with_device(device_id, |dev| {
            dev.metrics = metrics;
            dev.last_heartbeat = Some(Utc::now());
            dev.online = true;
        });
    }

    /// Set device connection state from an LWT/status event.
    pub fn set_device_connection_state(&self, device_id: &str, online: bool) {
        self.with_device(device_id, |dev| {
            dev.online = online;
            dev.last_conn_event = Some(Utc::now());
        });
    }

    /// Snapshot a device's presence record.
    pub fn device(&self, device_id: &str) -> Option<DevicePresence> {
        self.devices.read().unwrap().get(device_id).cloned()
    }

    /// True when the device has any online session or a recent status event
    /// marked it online.
    pub fn is_device_online(&self, device_id: &str) -> bool {
        self.devices
            .read()
            .unwrap()
            .get(device_id)
            .map(|d| d.online)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_online_offline_cycle() {
        let pm = presence_manager();
        pm.set_session_online("dev-t1", "s1");
        pm.set_session_online("dev-t1", "s2");
        assert!(pm.is_device_online("dev-t1"));

        pm.set_session_offline("dev-t1", "s1");
        assert!(pm.is_device_online("dev-t1"), "s2 still online");

        pm.set_session_offline("dev-t1", "s2");
        assert!(!pm.is_device_online("dev-t1"));
    }

    #[test]
    fn test_heartbeat_marks_online() {
        let pm = presence_manager();
        pm.update_heartbeat(
            "dev-t2",
            HeartbeatMetrics {
                timestamp: 1,
                battery: 88.0,
                temp: 31.5,
                net: "wifi".into(),
                rssi: -40,
            },
        );
        let dev = pm.device("dev-t2").unwrap();
        assert!(dev.online);
        assert_eq!(dev.metrics.net, "wifi");
    }

    #[test]
    fn test_connection_state_event() {
        let pm = presence_manager();
        pm.set_device_connection_state("dev-t3", true);
        assert!(pm.is_device_online("dev-t3"));
        pm.set_device_connection_state("dev-t3", false);
        assert!(!pm.is_device_online("dev-t3"));
    }

    #[test]
    fn test_unknown_device_is_offline() {
        assert!(!presence_manager().is_device_online("never-seen"));
    }
}
