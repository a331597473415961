//! Inbound control commands.
//!
//! Published to `<prefix>/command/<name>`; the payload is ignored. Commands are
//! queued on a channel and drained by the coordinator between cycles.

use std::sync::mpsc::{Receiver, TryRecvError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start (or extend) an activation without a detection.
    Activate,
    /// End the current hold now.
    Deactivate,
    /// Re-read the config and swap in the new pipeline snapshot.
    ReloadConfig,
}

impl ControlCommand {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "activate" | "on" => Some(Self::Activate),
            "deactivate" | "off" => Some(Self::Deactivate),
            "reload" | "reload_config" => Some(Self::ReloadConfig),
            _ => None,
        }
    }

    /// Parse a full topic under `<prefix>/command/`. Unknown names are logged
    /// and dropped.
    pub fn from_topic(prefix: &str, topic: &str) -> Option<Self> {
        let name = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix("/command/"))?;
        let parsed = Self::parse(name);
        if parsed.is_none() {
            log::warn!("ignoring unknown control command '{}'", name);
        }
        parsed
    }
}

/// Everything queued right now, without blocking.
pub fn drain(rx: &Receiver<ControlCommand>) -> Vec<ControlCommand> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(cmd) => out.push(cmd),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_topics() {
        assert_eq!(
            ControlCommand::from_topic("schoolbus", "schoolbus/command/activate"),
            Some(ControlCommand::Activate)
        );
        assert_eq!(
            ControlCommand::from_topic("schoolbus", "schoolbus/command/Reload"),
            Some(ControlCommand::ReloadConfig)
        );
        assert_eq!(
            ControlCommand::from_topic("schoolbus", "schoolbus/command/selfdestruct"),
            None
        );
        assert_eq!(
            ControlCommand::from_topic("schoolbus", "other/command/activate"),
            None
        );
    }

    #[test]
    fn drain_collects_in_order() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(ControlCommand::Activate).unwrap();
        tx.send(ControlCommand::Deactivate).unwrap();
        assert_eq!(
            drain(&rx),
            vec![ControlCommand::Activate, ControlCommand::Deactivate]
        );
        assert!(drain(&rx).is_empty());
    }
}
