//! [`TierProbe`] over real wgpu adapters.
//!
//! Each tier has one hard requirement checked against the adapter before a
//! device is requested:
//!
//! | tier    | requirement                                    |
//! |---------|------------------------------------------------|
//! | compute | compute shaders in the downlevel capabilities  |
//! | render  | `Rgba32Float` usable as a render attachment    |
//! | legacy  | WebGL2-class limits                            |
//!
//! Adapters are tried in power-preference order. The first one that meets
//! the requirement and opens a device wins.

use std::sync::Arc;

use tracing::{debug, error};

use super::{GpuDevice, STATE_FORMAT};
use crate::capability::{
    vendor_name, DeviceLimits, FeatureSet, PowerPreference, ProbedTier, Tier, TierCapabilities,
    TierProbe,
};
use crate::context::allowlisted_features;
use crate::error::ProbeError;

pub struct WgpuProbe {
    instance: Arc<wgpu::Instance>,
    power_preference: PowerPreference,
}

impl WgpuProbe {
    pub fn new(power_preference: PowerPreference) -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        Self {
            instance: Arc::new(instance),
            power_preference,
        }
    }

    fn ranked_adapters(&self) -> Vec<wgpu::Adapter> {
        let mut adapters = self.instance.enumerate_adapters(wgpu::Backends::all());
        let preference = self.power_preference;
        adapters.sort_by_key(|adapter| adapter_rank(&adapter.get_info(), preference));
        adapters
    }

    fn open(&self, adapter: wgpu::Adapter, tier: Tier) -> Result<GpuDevice, ProbeError> {
        let required_limits = match tier {
            Tier::Legacy => wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits()),
            _ => adapter.limits(),
        };
        let required_features = adapter.features() & allowlisted_features();
        let label = format!("tpe {tier} device");

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some(&label),
                required_features,
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|err| ProbeError::DeviceRequest {
            tier,
            message: err.to_string(),
        })?;

        device.on_uncaptured_error(Box::new(move |err| {
            error!(target: "tpe::probe", %tier, "uncaptured device error: {err}");
        }));

        Ok(GpuDevice {
            instance: self.instance.clone(),
            info: adapter.get_info(),
            adapter,
            device,
            queue,
        })
    }
}

impl TierProbe for WgpuProbe {
    fn try_tier(&mut self, tier: Tier) -> Result<ProbedTier, ProbeError> {
        if !tier.uses_gpu() {
            return Err(ProbeError::NoAdapter { tier });
        }

        let mut last_error = ProbeError::NoAdapter { tier };
        for adapter in self.ranked_adapters() {
            let info = adapter.get_info();
            if let Err(err) = check_requirements(&adapter, tier) {
                debug!(target: "tpe::probe", %tier, adapter = %info.name, %err, "adapter rejected");
                last_error = err;
                continue;
            }
            match self.open(adapter, tier) {
                Ok(gpu) => {
                    let capabilities = describe(tier, &gpu);
                    return Ok(ProbedTier {
                        capabilities,
                        device: Some(Arc::new(gpu)),
                    });
                }
                Err(err) => {
                    debug!(target: "tpe::probe", %tier, adapter = %info.name, %err, "device request failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}

fn adapter_rank(info: &wgpu::AdapterInfo, preference: PowerPreference) -> u8 {
    use wgpu::DeviceType;
    match (preference, info.device_type) {
        (PowerPreference::HighPerformance, DeviceType::DiscreteGpu) => 0,
        (PowerPreference::HighPerformance, DeviceType::IntegratedGpu) => 1,
        (PowerPreference::LowPower, DeviceType::IntegratedGpu) => 0,
        (PowerPreference::LowPower, DeviceType::DiscreteGpu) => 1,
        (_, DeviceType::VirtualGpu) => 2,
        (_, DeviceType::Other) => 3,
        (_, DeviceType::Cpu) => 4,
    }
}

fn check_requirements(adapter: &wgpu::Adapter, tier: Tier) -> Result<(), ProbeError> {
    let met = match tier {
        Tier::Compute => adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
        Tier::Render => adapter
            .get_texture_format_features(STATE_FORMAT)
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING),
        Tier::Legacy => wgpu::Limits::downlevel_webgl2_defaults().check_limits(&adapter.limits()),
        Tier::Software => false,
    };
    if met {
        Ok(())
    } else {
        Err(ProbeError::MissingCapability {
            tier,
            requirement: requirement_name(tier),
        })
    }
}

fn requirement_name(tier: Tier) -> &'static str {
    match tier {
        Tier::Compute => "compute shaders",
        Tier::Render => "renderable Rgba32Float textures",
        Tier::Legacy => "WebGL2-class device limits",
        Tier::Software => "nothing",
    }
}

fn describe(tier: Tier, gpu: &GpuDevice) -> TierCapabilities {
    let info = &gpu.info;
    let limits = gpu.device.limits();
    let features = gpu.device.features();
    let downlevel = gpu.adapter.get_downlevel_capabilities();
    let renderable = |format: wgpu::TextureFormat| {
        gpu.adapter
            .get_texture_format_features(format)
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT)
    };

    let feature_set = FeatureSet {
        compute_shaders: downlevel.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
        instancing: true,
        vertex_arrays: true,
        multiple_render_targets: limits.max_color_attachments >= 4,
        float_textures: renderable(STATE_FORMAT),
        half_float_textures: renderable(wgpu::TextureFormat::Rgba16Float),
        anisotropic_filtering: downlevel
            .flags
            .contains(wgpu::DownlevelFlags::ANISOTROPIC_FILTERING),
        timer_queries: features.contains(wgpu::Features::TIMESTAMP_QUERY),
        multi_draw_indirect: features.contains(wgpu::Features::MULTI_DRAW_INDIRECT),
        offscreen_surface: true,
    };

    TierCapabilities {
        tier,
        backend_api: info.backend.to_str().to_string(),
        vendor: vendor_name(info.vendor),
        renderer: info.name.clone(),
        driver: format!("{} {}", info.driver, info.driver_info).trim().to_string(),
        limits: DeviceLimits::from(&limits),
        features: feature_set,
        score: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(device_type: wgpu::DeviceType) -> wgpu::AdapterInfo {
        wgpu::AdapterInfo {
            name: "test".into(),
            vendor: 0,
            device: 0,
            device_type,
            driver: String::new(),
            driver_info: String::new(),
            backend: wgpu::Backend::Vulkan,
        }
    }

    #[test]
    fn adapters_rank_by_power_preference() {
        let discrete = info(wgpu::DeviceType::DiscreteGpu);
        let integrated = info(wgpu::DeviceType::IntegratedGpu);
        let cpu = info(wgpu::DeviceType::Cpu);

        let high = PowerPreference::HighPerformance;
        assert!(adapter_rank(&discrete, high) < adapter_rank(&integrated, high));
        assert!(adapter_rank(&integrated, high) < adapter_rank(&cpu, high));

        let low = PowerPreference::LowPower;
        assert!(adapter_rank(&integrated, low) < adapter_rank(&discrete, low));
    }

    #[test]
    fn software_is_never_probed_on_an_adapter() {
        let mut probe = WgpuProbe::new(PowerPreference::LowPower);
        assert!(matches!(
            probe.try_tier(Tier::Software),
            Err(ProbeError::NoAdapter { tier: Tier::Software })
        ));
    }
}
