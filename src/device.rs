//! Compute backend probing & selection.
use anyhow::anyhow;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{fmt, process::Command, str::FromStr};

/// Compute backend a metric may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Apple unified memory GPU (Metal Performance Shaders).
    Mps,
    /// Cross platform GPU.
    Vulkan,
    /// Nvidia GPU.
    Cuda,
    /// Always available.
    Cpu,
}

impl Backend {
    /// Accelerators in probe priority order.
    pub const ACCELERATORS: [Self; 3] = [Self::Mps, Self::Vulkan, Self::Cuda];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mps => "mps",
            Self::Vulkan => "vulkan",
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mps" | "metal" => Ok(Self::Mps),
            "vulkan" => Ok(Self::Vulkan),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "cpu" => Ok(Self::Cpu),
            _ => Err(anyhow!(
                "unknown device `{s}`, expected one of mps, vulkan, cuda, cpu"
            )),
        }
    }
}

/// Probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Usable,
    Unavailable(String),
}

/// Reports whether an accelerator backend can be used on this machine.
pub trait Probe {
    fn probe(&self, backend: Backend) -> Availability;
}

/// Probes the local system by querying platform & driver tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl Probe for SystemProbe {
    fn probe(&self, backend: Backend) -> Availability {
        match backend {
            Backend::Mps => match cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                true => Availability::Usable,
                false => Availability::Unavailable("requires apple silicon".into()),
            },
            Backend::Vulkan => tool_succeeds("vulkaninfo", &["--summary"], "GPU"),
            Backend::Cuda => tool_succeeds("nvidia-smi", &["-L"], "GPU"),
            Backend::Cpu => Availability::Usable,
        }
    }
}

fn tool_succeeds(program: &str, args: &[&str], expect: &str) -> Availability {
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() && String::from_utf8_lossy(&out.stdout).contains(expect) => {
            Availability::Usable
        }
        Ok(out) => Availability::Unavailable(format!("{program} exit code {:?}", out.status.code())),
        Err(err) => Availability::Unavailable(format!("{program}: {err}")),
    }
}

/// Ordered backend preference, always ending with [`Backend::Cpu`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChoice(Vec<Backend>);

impl DeviceChoice {
    pub fn cpu() -> Self {
        Self(vec![Backend::Cpu])
    }

    /// Most preferred backend.
    pub fn preferred(&self) -> Backend {
        self.0.first().copied().unwrap_or(Backend::Cpu)
    }

    pub fn backends(&self) -> &[Backend] {
        &self.0
    }

    /// Choice without backends a metric cannot use. Never removes cpu.
    pub fn narrowed(&self, unsupported: &[Backend]) -> Self {
        Self(
            self.0
                .iter()
                .copied()
                .filter(|b| *b == Backend::Cpu || !unsupported.contains(b))
                .collect(),
        )
    }
}

impl fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, b) in self.backends().iter().enumerate() {
            if idx > 0 {
                f.write_str(" > ")?;
            }
            b.fmt(f)?;
        }
        Ok(())
    }
}

/// Probe accelerators in priority order, or in `hint` order if non-empty, returning
/// all usable ones followed by the cpu fallback.
pub fn resolve(hint: &[Backend], probe: &impl Probe) -> DeviceChoice {
    let candidates: &[Backend] = match hint.is_empty() {
        true => &Backend::ACCELERATORS,
        false => hint,
    };

    let mut usable = Vec::with_capacity(candidates.len() + 1);
    for &backend in candidates {
        if backend == Backend::Cpu || usable.contains(&backend) {
            continue;
        }
        match probe.probe(backend) {
            Availability::Usable => {
                debug!("device {backend} usable");
                usable.push(backend);
            }
            Availability::Unavailable(reason) => debug!("device {backend} unavailable: {reason}"),
        }
    }
    usable.push(Backend::Cpu);
    DeviceChoice(usable)
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeProbe(&'static [Backend]);

    impl Probe for FakeProbe {
        fn probe(&self, backend: Backend) -> Availability {
            match self.0.contains(&backend) {
                true => Availability::Usable,
                false => Availability::Unavailable("fake".into()),
            }
        }
    }

    #[test]
    fn all_probes_fail_cpu_only() {
        let choice = resolve(&[], &FakeProbe(&[]));
        assert_eq!(choice, DeviceChoice::cpu());
        assert_eq!(choice.preferred(), Backend::Cpu);
    }

    #[test]
    fn priority_order() {
        let choice = resolve(&[], &FakeProbe(&[Backend::Cuda, Backend::Vulkan]));
        assert_eq!(
            choice.backends(),
            [Backend::Vulkan, Backend::Cuda, Backend::Cpu]
        );
        assert_eq!(choice.preferred(), Backend::Vulkan);
    }

    #[test]
    fn hint_order_and_dedup() {
        let all = FakeProbe(&[Backend::Mps, Backend::Vulkan, Backend::Cuda]);
        let choice = resolve(&[Backend::Cuda, Backend::Cpu, Backend::Cuda], &all);
        assert_eq!(choice.backends(), [Backend::Cuda, Backend::Cpu]);

        let choice = resolve(&[Backend::Cpu], &all);
        assert_eq!(choice, DeviceChoice::cpu());
    }

    #[test]
    fn narrowed_keeps_cpu() {
        let choice = resolve(&[], &FakeProbe(&[Backend::Mps, Backend::Cuda]));
        let narrow = choice.narrowed(&[Backend::Mps, Backend::Cpu]);
        assert_eq!(narrow.backends(), [Backend::Cuda, Backend::Cpu]);
        assert_eq!(choice.narrowed(&Backend::ACCELERATORS), DeviceChoice::cpu());
    }

    #[test]
    fn parse_backend() {
        assert_eq!("CUDA".parse::<Backend>().unwrap(), Backend::Cuda);
        assert_eq!("metal".parse::<Backend>().unwrap(), Backend::Mps);
        assert!("tpu".parse::<Backend>().is_err());
    }

    #[test]
    fn display_choice() {
        let choice = resolve(&[], &FakeProbe(&[Backend::Cuda]));
        assert_eq!(choice.to_string(), "cuda > cpu");
    }
}
