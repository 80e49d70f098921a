use thiserror::Error;
use tracing::debug;

/// Errors produced by signal collection.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// Not a single machine-specific signal could be gathered.
    #[error("no machine-specific signals available on this host")]
    NoSignals,
}

/// Source of semi-stable, machine-specific signal strings. Signals are
/// platform-specific in origin but opaque to callers; individual signals are
/// best-effort and an unavailable one is skipped, not fatal.
pub trait SignalSource {
    fn collect(&self) -> Result<Vec<String>, CollectionError>;
}

/// The build-time platform implementation.
pub struct HostSignals;

impl SignalSource for HostSignals {
    fn collect(&self) -> Result<Vec<String>, CollectionError> {
        let mut signals = platform::signals();

        if let Ok(name) = hostname::get() {
            let name = name.to_string_lossy();
            if !name.is_empty() {
                signals.push(name.into_owned());
            }
        }

        if signals.is_empty() {
            return Err(CollectionError::NoSignals);
        }
        debug!(count = signals.len(), "collected machine signals");
        Ok(signals)
    }
}

/// Deterministic source for tests; yields exactly the given signals.
#[derive(Debug, Clone, Default)]
pub struct FixedSignals {
    signals: Vec<String>,
}

impl FixedSignals {
    pub fn new<I, S>(signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            signals: signals.into_iter().map(Into::into).collect(),
        }
    }
}

impl SignalSource for FixedSignals {
    fn collect(&self) -> Result<Vec<String>, CollectionError> {
        if self.signals.is_empty() {
            return Err(CollectionError::NoSignals);
        }
        Ok(self.signals.clone())
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use std::fs;
    use std::path::Path;

    /// OS install id, CPU descriptor, and primary MAC, in priority order.
    /// Each is best-effort.
    pub(super) fn signals() -> Vec<String> {
        let mut out = Vec::new();
        if let Some(id) = os_install_id() {
            out.push(id);
        }
        if let Some(cpu) = cpu_info() {
            out.push(cpu);
        }
        if let Some(mac) = primary_mac() {
            out.push(mac);
        }
        out
    }

    /// systemd machine id, with the dbus location as fallback.
    fn os_install_id() -> Option<String> {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(contents) = fs::read_to_string(path) {
                let id = contents.trim();
                if !id.is_empty() {
                    return Some(id.to_string());
                }
            }
        }
        None
    }

    /// CPU model name, plus the serial where the SoC exposes one.
    fn cpu_info() -> Option<String> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
        let mut model = None;
        let mut serial = None;
        for line in cpuinfo.lines() {
            if let Some(value) = field(line, "model name") {
                model.get_or_insert(value);
            } else if let Some(value) = field(line, "Serial") {
                serial.get_or_insert(value);
            }
        }
        let model = model?;
        Some(match serial {
            Some(serial) => format!("{model}|{serial}"),
            None => model,
        })
    }

    fn field(line: &str, name: &str) -> Option<String> {
        let rest = line.strip_prefix(name)?;
        let (_, value) = rest.split_once(':')?;
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    /// Hardware address of the first non-loopback interface, by sysfs name
    /// order so repeated collection is stable.
    fn primary_mac() -> Option<String> {
        let mut names: Vec<_> = fs::read_dir("/sys/class/net")
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != "lo")
            .collect();
        names.sort();

        for name in names {
            let path = Path::new("/sys/class/net").join(&name).join("address");
            if let Ok(address) = fs::read_to_string(path) {
                let address = address.trim();
                if !address.is_empty() && address.bytes().any(|b| b != b'0' && b != b':') {
                    return Some(address.to_string());
                }
            }
        }
        None
    }
}

#[cfg(windows)]
mod platform {
    use std::env;

    /// OS install GUID and CPU descriptor. The MAC signal is not collected
    /// here; the remaining classes keep the fingerprint stable.
    pub(super) fn signals() -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(id) = machine_uid::get() {
            if !id.is_empty() {
                out.push(id);
            }
        }
        if let Some(cpu) = env::var_os("PROCESSOR_IDENTIFIER") {
            let cpu = cpu.to_string_lossy();
            if !cpu.is_empty() {
                out.push(cpu.into_owned());
            }
        }
        out
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod platform {
    pub(super) fn signals() -> Vec<String> {
        Vec::new()
    }
}
