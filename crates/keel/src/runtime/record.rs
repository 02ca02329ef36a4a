//! The persisted container record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Format of `createdTime`.
pub const CREATED_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// The container process is (believed to be) alive.
    Running,
    /// Stopped by `keel stop`.
    Stopped,
    /// The process went away on its own.
    Exited,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Everything the runtime remembers about one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Generated numeric id.
    pub id: String,
    /// Host PID; blank once stopped.
    pub pid: String,
    /// Space-joined user command.
    pub command: String,
    /// Creation time, local, [`CREATED_TIME_FORMAT`].
    #[serde(rename = "createdTime")]
    pub created_time: String,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Unique name, the record's key.
    pub name: String,
    /// `hostPath:containerPath`, or blank.
    pub volume: String,
    /// Published ports as `hostPort:containerPort`.
    #[serde(rename = "portmapping")]
    pub port_mapping: Vec<String>,
    /// Network the container is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Address allocated on [`ContainerRecord::network`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl ContainerRecord {
    /// A running container created now.
    #[must_use]
    pub fn running(id: &str, name: &str, pid: u32, command: &[String]) -> Self {
        Self {
            id: id.to_string(),
            pid: pid.to_string(),
            command: command.join(" "),
            created_time: chrono::Local::now().format(CREATED_TIME_FORMAT).to_string(),
            status: ContainerStatus::Running,
            name: name.to_string(),
            volume: String::new(),
            port_mapping: Vec::new(),
            network: None,
            ip: None,
        }
    }

    /// The PID as a number, if one is recorded.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid.trim().parse().ok()
    }

    /// Mark as stopped and forget the PID.
    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.pid = String::new();
    }

    /// Mark as exited, keeping the last PID for reference.
    pub fn mark_exited(&mut self) {
        self.status = ContainerStatus::Exited;
    }

    /// Whether the record claims a live process.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ContainerStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContainerRecord {
        let mut record = ContainerRecord::running(
            "0123456789",
            "web",
            4242,
            &["top".to_string(), "-b".to_string()],
        );
        record.volume = "/data:/data".to_string();
        record.port_mapping = vec!["8080:80".to_string()];
        record
    }

    #[test]
    fn json_field_names() {
        let json: serde_json::Value = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["id"], "0123456789");
        assert_eq!(json["pid"], "4242");
        assert_eq!(json["command"], "top -b");
        assert_eq!(json["status"], "running");
        assert_eq!(json["portmapping"][0], "8080:80");
        assert!(json.get("createdTime").is_some());
        assert!(json.get("network").is_none());
    }

    #[test]
    fn created_time_format() {
        let record = sample();
        assert!(
            chrono::NaiveDateTime::parse_from_str(&record.created_time, CREATED_TIME_FORMAT)
                .is_ok()
        );
    }

    #[test]
    fn stop_clears_pid_only() {
        let before = sample();
        let mut after = before.clone();
        after.mark_stopped();

        assert_eq!(after.status, ContainerStatus::Stopped);
        assert_eq!(after.pid, "");
        assert_eq!(after.pid(), None);
        assert_eq!(after.id, before.id);
        assert_eq!(after.name, before.name);
        assert_eq!(after.command, before.command);
        assert_eq!(after.created_time, before.created_time);
    }

    #[test]
    fn reads_record_without_network_fields() {
        let json = r#"{"id":"1","pid":"","command":"sh","createdTime":"2024-01-01 00:00:00",
            "status":"stopped","name":"a","volume":"","portmapping":[]}"#;
        let record: ContainerRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, ContainerStatus::Stopped);
        assert!(record.network.is_none());
    }
}
