//! Hardware capability probing for local pipelines.
//!
//! Probing runs once at startup; the resulting [`Capabilities`] are handed to
//! each local provider, which never re-probes.

use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::debug;

/// Coarse summary of what the local backend can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// No local backend is compiled in.
    Unavailable,
    /// Local inference runs on the CPU only.
    CpuOnly,
    /// An accelerator and its runtime are present.
    Accelerated,
    /// Accelerated, with 8-bit weight quantization support.
    Quantized,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Unavailable => "unavailable",
            Capability::CpuOnly => "cpu-only",
            Capability::Accelerated => "accelerated",
            Capability::Quantized => "quantized",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accelerator {
    pub name: String,
    /// CUDA compute capability as (major, minor)
    pub compute_capability: (u32, u32),
}

impl Accelerator {
    /// bfloat16 arithmetic needs compute capability 8.0 (Ampere) or newer.
    pub fn supports_bf16(&self) -> bool {
        self.compute_capability.0 >= 8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether a local backend exists in this build at all
    pub local_backend: bool,
    pub accelerator: Option<Accelerator>,
    /// The backend was built with accelerator support
    pub acceleration_runtime: bool,
    /// 8-bit weight quantization is available on the accelerator
    pub int8_quantization: bool,
}

impl Capabilities {
    pub fn cpu_only() -> Self {
        Self {
            local_backend: true,
            accelerator: None,
            acceleration_runtime: false,
            int8_quantization: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            local_backend: false,
            ..Self::cpu_only()
        }
    }

    /// An accelerator is present and the backend can drive it.
    pub fn is_accelerated(&self) -> bool {
        self.accelerator.is_some() && self.acceleration_runtime
    }

    pub fn supports_bf16(&self) -> bool {
        self.accelerator.as_ref().is_some_and(Accelerator::supports_bf16)
    }

    pub fn level(&self) -> Capability {
        if !self.local_backend {
            Capability::Unavailable
        } else if !self.is_accelerated() {
            Capability::CpuOnly
        } else if self.int8_quantization {
            Capability::Quantized
        } else {
            Capability::Accelerated
        }
    }
}

/// Source of [`Capabilities`].
pub trait HardwareProbe {
    fn probe(&self) -> Capabilities;
}

/// Probe that returns a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticProbe(pub Capabilities);

impl HardwareProbe for StaticProbe {
    fn probe(&self) -> Capabilities {
        self.0.clone()
    }
}

/// Probe the running machine and this build.
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

impl HardwareProbe for SystemProbe {
    fn probe(&self) -> Capabilities {
        let local_backend = cfg!(feature = "llama");
        let acceleration_runtime = cfg!(feature = "cuda");
        let accelerator = detect_nvidia();

        let capabilities = Capabilities {
            local_backend,
            accelerator,
            acceleration_runtime,
            // llama.cpp CUDA builds always carry the 8-bit kernels
            int8_quantization: acceleration_runtime,
        };
        debug!(
            "Probed capabilities: level={}, accelerator={:?}",
            capabilities.level(),
            capabilities.accelerator
        );
        capabilities
    }
}

/// Detect the first NVIDIA GPU using nvidia-smi
fn detect_nvidia() -> Option<Accelerator> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,compute_cap", "--format=csv,noheader"])
        .output()
        .ok()?;

    if !output.status.success() {
        debug!("nvidia-smi exited with {}", output.status);
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<Accelerator> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let (name, cap) = line.rsplit_once(',')?;
    let (major, minor) = cap.trim().split_once('.')?;

    Some(Accelerator {
        name: name.trim().to_string(),
        compute_capability: (major.parse().ok()?, minor.parse().ok()?),
    })
}
