//! Device context: the handles and ray tracing capabilities supplied by the
//! host application's device setup.

use ash::khr::{acceleration_structure, ray_tracing_pipeline};
use ash::{vk, Device, Instance};
use std::ffi::CStr;

use crate::error::{Result, RtError};

/// Ray tracing capabilities of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub max_ray_recursion_depth: u32,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

/// Borrowed view of the host's Vulkan device, plus the extension loaders the
/// ray tracing core needs.
///
/// The host owns the instance and device; dropping this context destroys
/// neither.
pub struct VulkanContext {
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue: vk::Queue,
    pub queue_family: u32,

    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,
    pub debug_utils: Option<ash::ext::debug_utils::Device>,

    pub rt_capabilities: RtCapabilities,
}

impl VulkanContext {
    /// Wrap the host's device and query its ray tracing properties.
    ///
    /// The device must have been created with `VK_KHR_acceleration_structure`,
    /// `VK_KHR_ray_tracing_pipeline`, `VK_KHR_deferred_host_operations` and
    /// the `bufferDeviceAddress` feature enabled. Debug labels start disabled;
    /// see [`VulkanContext::set_debug_labels`].
    ///
    /// # Safety
    /// All handles must be valid and outlive the returned context.
    pub unsafe fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        device: &Device,
        queue_family: u32,
    ) -> Result<Self> {
        let rt_capabilities = Self::check_rt_support(instance, physical_device);
        if !rt_capabilities.supported {
            return Err(RtError::NotSupported(
                "device lacks acceleration structure or ray tracing pipeline support".into(),
            ));
        }

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        tracing::info!(
            gpu = %name,
            handle_size = rt_capabilities.shader_group_handle_size,
            max_recursion = rt_capabilities.max_ray_recursion_depth,
            "ray tracing device ready"
        );

        let queue = device.get_device_queue(queue_family, 0);
        let accel_struct_loader = acceleration_structure::Device::new(instance, device);
        let rt_pipeline_loader = ray_tracing_pipeline::Device::new(instance, device);

        Ok(Self {
            instance: instance.clone(),
            physical_device,
            device: device.clone(),
            queue,
            queue_family,
            accel_struct_loader,
            rt_pipeline_loader,
            debug_utils: None,
            rt_capabilities,
        })
    }

    /// Check ray tracing support on a physical device.
    pub unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return RtCapabilities::default(),
        };

        let has_extension = |wanted: &CStr| {
            extensions.iter().any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has_extension(acceleration_structure::NAME) || !has_extension(ray_tracing_pipeline::NAME) {
            return RtCapabilities::default();
        }

        // Query RT properties
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut accel_props);

        instance.get_physical_device_properties2(device, &mut props2);

        // Query RT features
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE &&
                       rt_features.ray_tracing_pipeline == vk::TRUE,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            shader_group_handle_size: rt_props.shader_group_handle_size,
            shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
            shader_group_base_alignment: rt_props.shader_group_base_alignment,
            max_geometry_count: accel_props.max_geometry_count,
            max_instance_count: accel_props.max_instance_count,
            max_primitive_count: accel_props.max_primitive_count,
            min_scratch_offset_alignment: accel_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Turn `VK_EXT_debug_utils` labels and object names on or off.
    ///
    /// # Safety
    /// Enabling requires the instance to have been created with
    /// `VK_EXT_debug_utils`.
    pub unsafe fn set_debug_labels(&mut self, enabled: bool) {
        let (instance, device) = (&self.instance, &self.device);
        self.debug_utils = select_loader(self.debug_utils.take(), enabled, || {
            ash::ext::debug_utils::Device::new(instance, device)
        });
    }

    pub fn debug_labels_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    /// Attach a debug name to a Vulkan object, when debug labels are enabled.
    pub unsafe fn set_object_name<H: vk::Handle>(&self, handle: H, name: &CStr) {
        if let Some(debug_utils) = &self.debug_utils {
            let info = vk::DebugUtilsObjectNameInfoEXT::default()
                .object_handle(handle)
                .object_name(name);
            if let Err(e) = debug_utils.set_debug_utils_object_name(&info) {
                tracing::debug!("failed to name object {:?}: {:?}", name, e);
            }
        }
    }

    /// Open a debug label region in a command buffer.
    pub unsafe fn begin_label(&self, cmd: vk::CommandBuffer, name: &CStr) {
        if let Some(debug_utils) = &self.debug_utils {
            let label = vk::DebugUtilsLabelEXT::default().label_name(name);
            debug_utils.cmd_begin_debug_utils_label(cmd, &label);
        }
    }

    /// Close the innermost debug label region.
    pub unsafe fn end_label(&self, cmd: vk::CommandBuffer) {
        if let Some(debug_utils) = &self.debug_utils {
            debug_utils.cmd_end_debug_utils_label(cmd);
        }
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

/// Keep, load or drop an optional extension loader. An existing loader is
/// reused rather than loaded twice.
fn select_loader<T>(current: Option<T>, enabled: bool, load: impl FnOnce() -> T) -> Option<T> {
    if enabled {
        Some(current.unwrap_or_else(load))
    } else {
        None
    }
}
