//! Targets that a protocol instance can be attached to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::monitor::Monitor;

/// Kind of execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Qemu,
    Panda,
    Gdb,
    OpenOcd,
    JLink,
    Unicorn,
}

impl TargetKind {
    /// Target kinds whose emulator implements the ARMv7-M interrupt commands.
    pub const INTERRUPT_FORWARDING: &'static [TargetKind] = &[TargetKind::Qemu, TargetKind::Panda];

    pub fn supports_interrupt_forwarding(&self) -> bool {
        Self::INTERRUPT_FORWARDING.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Panda => "panda",
            Self::Gdb => "gdb",
            Self::OpenOcd => "openocd",
            Self::JLink => "jlink",
            Self::Unicorn => "unicorn",
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown target kind '{0}'")]
pub struct UnknownTargetKind(pub String);

impl std::str::FromStr for TargetKind {
    type Err = UnknownTargetKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "qemu" => Ok(Self::Qemu),
            "panda" => Ok(Self::Panda),
            "gdb" => Ok(Self::Gdb),
            "openocd" => Ok(Self::OpenOcd),
            "jlink" => Ok(Self::JLink),
            "unicorn" => Ok(Self::Unicorn),
            _ => Err(UnknownTargetKind(s.to_string())),
        }
    }
}

/// A receive/send pair of queue names, seen from the side that owns them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueuePair {
    pub rx: String,
    pub tx: String,
}

impl QueuePair {
    pub fn new(rx: impl Into<String>, tx: impl Into<String>) -> Self {
        Self {
            rx: rx.into(),
            tx: tx.into(),
        }
    }

    /// Fresh, collision-free POSIX queue names: `/{prefix}_rx_{uuid}` and `/{prefix}_tx_{uuid}`.
    pub fn generate(prefix: &str) -> Self {
        let tag = uuid::Uuid::new_v4().simple();
        Self::new(
            format!("/{prefix}_rx_{tag}"),
            format!("/{prefix}_tx_{tag}"),
        )
    }

    /// The same pair as the peer sees it.
    pub fn reversed(&self) -> Self {
        Self::new(self.tx.clone(), self.rx.clone())
    }
}

/// An execution target as seen by the interrupt protocol.
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TargetKind;

    /// Command interface of the emulator backing this target.
    fn monitor(&self) -> Arc<dyn Monitor>;

    /// Remote-memory queue names when the target can forward interrupts.
    ///
    /// The interrupt commands piggyback on the remote-memory transport, so a
    /// target without it cannot take part even if its kind is allowed.
    fn interrupt_forwarding(&self) -> Option<QueuePair> {
        None
    }
}

/// Plain [`Target`] for a QEMU-family emulator reachable through a monitor.
pub struct EmulatorTarget {
    name: String,
    kind: TargetKind,
    monitor: Arc<dyn Monitor>,
    remote_memory: Option<QueuePair>,
}

impl EmulatorTarget {
    pub fn new(name: impl Into<String>, kind: TargetKind, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            name: name.into(),
            kind,
            monitor,
            remote_memory: None,
        }
    }

    pub fn with_remote_memory(mut self, queues: QueuePair) -> Self {
        self.remote_memory = Some(queues);
        self
    }
}

impl Target for EmulatorTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn monitor(&self) -> Arc<dyn Monitor> {
        Arc::clone(&self.monitor)
    }

    fn interrupt_forwarding(&self) -> Option<QueuePair> {
        self.remote_memory.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_qemu_family_forwards_interrupts() {
        assert!(TargetKind::Qemu.supports_interrupt_forwarding());
        assert!(TargetKind::Panda.supports_interrupt_forwarding());
        for kind in [
            TargetKind::Gdb,
            TargetKind::OpenOcd,
            TargetKind::JLink,
            TargetKind::Unicorn,
        ] {
            assert!(!kind.supports_interrupt_forwarding(), "{kind}");
        }
    }

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("QEMU".parse::<TargetKind>(), Ok(TargetKind::Qemu));
        assert_eq!("openocd".parse::<TargetKind>(), Ok(TargetKind::OpenOcd));
        assert_eq!(
            "bochs".parse::<TargetKind>(),
            Err(UnknownTargetKind("bochs".to_string()))
        );
        for kind in [TargetKind::Panda, TargetKind::JLink, TargetKind::Unicorn] {
            assert_eq!(kind.to_string().parse::<TargetKind>(), Ok(kind));
        }
    }

    #[test]
    fn generated_pairs_are_distinct_posix_names() {
        let a = QueuePair::generate("avatar_irq");
        let b = QueuePair::generate("avatar_irq");
        assert_ne!(a, b);
        assert!(a.rx.starts_with("/avatar_irq_rx_"));
        assert!(a.tx.starts_with("/avatar_irq_tx_"));
        assert!(!a.rx[1..].contains('/'));
    }

    #[test]
    fn reversed_swaps_directions() {
        let pair = QueuePair::new("/a", "/b");
        assert_eq!(pair.reversed(), QueuePair::new("/b", "/a"));
    }
}
