//! Single-use command buffers for blocking setup work.
//!
//! Acceleration structure builds and SBT uploads are recorded into a
//! transient command buffer, submitted, and waited on before returning.
//! Per-frame recording happens in command buffers owned by the host.

use ash::vk;

use super::VulkanContext;
use crate::error::{Result, RtError};

/// Transient command pool for one-shot setup commands.
pub struct CommandManager {
    transient_pool: vk::CommandPool,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager on the context's queue family.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = ctx.device.create_command_pool(&transient_info, None)
            .map_err(RtError::vk("Failed to create transient pool"))?;

        Ok(Self {
            transient_pool,
            device: ctx.device.clone(),
        })
    }

    /// Begin a single-use command buffer.
    pub unsafe fn begin_single_time(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self.device.allocate_command_buffers(&alloc_info)
            .map_err(RtError::vk("Failed to allocate command buffer"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(RtError::vk("Failed to begin command buffer")(e));
        }

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, waiting for completion.
    ///
    /// The command buffer is freed whether or not submission succeeds.
    pub unsafe fn end_single_time(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self.submit_and_wait(ctx, cmd);
        self.device.free_command_buffers(self.transient_pool, &[cmd]);
        result
    }

    unsafe fn submit_and_wait(&self, ctx: &VulkanContext, cmd: vk::CommandBuffer) -> Result<()> {
        self.device.end_command_buffer(cmd)
            .map_err(RtError::vk("Failed to end command buffer"))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);

        ctx.device.queue_submit(ctx.queue, &[submit_info], vk::Fence::null())
            .map_err(RtError::vk("Failed to submit command buffer"))?;

        ctx.device.queue_wait_idle(ctx.queue)
            .map_err(RtError::vk("Failed to wait for queue"))
    }

    /// Record commands with `record` into a single-use command buffer, submit
    /// it and block until the queue is idle.
    pub unsafe fn run_single_time<F>(&self, ctx: &VulkanContext, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.begin_single_time()?;
        record(cmd);
        self.end_single_time(ctx, cmd)
    }

    /// Destroy the transient pool.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.transient_pool = vk::CommandPool::null();
    }
}
