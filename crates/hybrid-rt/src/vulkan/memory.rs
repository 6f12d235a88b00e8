//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{CommandManager, VulkanContext};
use crate::error::{Result, RtError};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl Buffer {
    /// Map the buffer memory for CPU access.
    ///
    /// Only buffers created with CPU-visible memory have a mapping.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// Write raw bytes to the start of a host-visible buffer.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(RtError::Buffer(format!(
                "write of {} bytes exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }
        let ptr = self.mapped_ptr()
            .ok_or_else(|| RtError::Buffer("buffer is not host visible".into()))?;
        // SAFETY: mapping covers `self.size` bytes and the length was checked.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    /// Device address, for buffers created with `SHADER_DEVICE_ADDRESS`.
    pub fn address(&self) -> Result<vk::DeviceAddress> {
        self.device_address
            .ok_or_else(|| RtError::Buffer("buffer was created without SHADER_DEVICE_ADDRESS usage".into()))
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }

    /// Create a buffer with the specified usage and memory location.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None)
            .map_err(RtError::vk("Failed to create buffer"))?;

        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            let _ = self.allocator.lock().free(allocation);
            return Err(RtError::vk("Failed to bind buffer memory")(e));
        }

        // Get device address if usage includes it
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            device_address,
        })
    }

    /// Create a staging buffer (CPU-visible, transfer source).
    pub unsafe fn create_staging_buffer(&self, size: vk::DeviceSize, name: &str) -> Result<Buffer> {
        self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            name,
        )
    }

    /// Create a host-visible buffer and fill it with `data`.
    pub unsafe fn create_host_buffer(
        &self,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Buffer> {
        let buffer = self.create_buffer(data.len() as vk::DeviceSize, usage, MemoryLocation::CpuToGpu, name)?;
        if let Err(e) = buffer.write_bytes(data) {
            self.destroy_buffer(buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Create a GPU-only buffer and upload `data` into it.
    ///
    /// The copy runs in a single-use command buffer and this call blocks
    /// until it completes; the staging buffer is released before returning.
    pub unsafe fn upload_to_device(
        &self,
        ctx: &VulkanContext,
        commands: &CommandManager,
        data: &[u8],
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<Buffer> {
        let size = data.len() as vk::DeviceSize;
        let staging = self.create_staging_buffer(size, "staging")?;
        if let Err(e) = staging.write_bytes(data) {
            self.destroy_buffer(staging);
            return Err(e);
        }

        let buffer = match self.create_buffer(size, usage | vk::BufferUsageFlags::TRANSFER_DST, MemoryLocation::GpuOnly, name) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.destroy_buffer(staging);
                return Err(e);
            }
        };

        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        let copied = commands.run_single_time(ctx, |cmd| {
            self.device.cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]);
        });

        self.destroy_buffer(staging);
        match copied {
            Ok(()) => Ok(buffer),
            Err(e) => {
                self.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    /// Destroy a buffer.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            let _ = self.allocator.lock().free(allocation);
        }
    }
}
