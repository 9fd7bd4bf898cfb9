use std::{cell::RefCell, collections::HashMap};

use ash::vk;
use vk_mem::Alloc;

use crate::{
    basic::color::LabelColor,
    commands::{
        barrier::{GfxBarrierMask, GfxImageBarrier},
        command_buffer::GfxCommandBuffer,
        command_stream::GfxCommandStream,
        fence::GfxFence,
    },
    device::GfxDevice,
    error::{GfxError, GfxResult},
    resources::{
        buffer::{GfxBuffer, GfxBufferDesc},
        image::{GfxImage, GfxImageDesc, ImageSource, VulkanFormatUtils},
    },
};

/// 创建 [`GfxContext`] 需要的对象
///
/// instance / device / queue 的创建属于窗口和设备初始化，不在这里做。
pub struct GfxContextCreateInfo {
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
    pub allocator: vk_mem::Allocator,
    pub debug_utils: Option<ash::ext::debug_utils::Device>,
    pub frames_in_flight: usize,
}

struct FrameCommandSlot {
    pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
}

/// Vulkan 设备上下文
///
/// 每个 frame slot 一个 command pool，录制新帧前整体 reset。
/// buffer 和 image 的 allocation 保存在这里，外部只拿到句柄记录。
pub struct GfxContext {
    device: ash::Device,
    queue: vk::Queue,
    allocator: vk_mem::Allocator,
    debug_utils: Option<ash::ext::debug_utils::Device>,

    frame_slots: Vec<FrameCommandSlot>,
    /// one-time 命令使用的 pool
    temp_pool: vk::CommandPool,

    buffer_allocations: RefCell<HashMap<vk::Buffer, vk_mem::Allocation>>,
    image_allocations: RefCell<HashMap<vk::Image, vk_mem::Allocation>>,
}
// new & init
impl GfxContext {
    pub fn new(create_info: GfxContextCreateInfo) -> GfxResult<Self> {
        let GfxContextCreateInfo {
            device,
            queue,
            queue_family_index,
            allocator,
            debug_utils,
            frames_in_flight,
        } = create_info;

        let pool_ci = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family_index);
        let mut frame_slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            let pool = unsafe { device.create_command_pool(&pool_ci, None)? };
            let command_buffer = unsafe {
                device.allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )?[0]
            };
            frame_slots.push(FrameCommandSlot { pool, command_buffer });
        }

        let temp_pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue_family_index)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                None,
            )?
        };

        log::info!("gfx context created with {} frame slots", frames_in_flight);
        Ok(Self {
            device,
            queue,
            allocator,
            debug_utils,
            frame_slots,
            temp_pool,
            buffer_allocations: RefCell::new(HashMap::new()),
            image_allocations: RefCell::new(HashMap::new()),
        })
    }
}
// getters
impl GfxContext {
    #[inline]
    pub fn ash_device(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }
}
// tools
impl GfxContext {
    fn set_debug_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_handle(handle).object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("failed to set debug name: {e}");
        }
    }

    /// 立即执行某个 command，并同步等待执行结果
    fn one_time_exec<F, R>(&self, func: F, name: &str) -> GfxResult<R>
    where
        F: FnOnce(&mut GfxCommandBuffer) -> R,
    {
        let vk_cmd = unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.temp_pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1),
            )?[0]
        };
        let mut command_buffer =
            GfxCommandBuffer::new(vk_cmd, self.device.clone(), self.debug_utils.clone(), &format!("one-time-{name}"));

        command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        let result = func(&mut command_buffer);
        command_buffer.end()?;

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(vk_cmd)];
        let submit_result = unsafe {
            self.device
                .queue_submit2(self.queue, &[vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos)], fence)
                .and_then(|_| self.device.wait_for_fences(&[fence], true, u64::MAX))
        };
        unsafe {
            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.temp_pool, &[vk_cmd]);
        }
        submit_result?;

        Ok(result)
    }

    /// host 可见的临时 buffer，只作为 transfer 的 src
    fn create_stage_buffer(&self, data: &[u8], name: &str) -> GfxResult<(vk::Buffer, vk_mem::Allocation)> {
        let buffer_ci = vk::BufferCreateInfo::default()
            .size(data.len() as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferHost,
            flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
            ..Default::default()
        };

        unsafe {
            let (buffer, mut allocation) = self.allocator.create_buffer(&buffer_ci, &alloc_ci)?;
            let write_result = self.allocator.map_memory(&mut allocation).and_then(|ptr| {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
                self.allocator.unmap_memory(&mut allocation);
                self.allocator.flush_allocation(&allocation, 0, data.len() as vk::DeviceSize)
            });
            if let Err(e) = write_result {
                self.allocator.destroy_buffer(buffer, &mut allocation);
                return Err(e.into());
            }
            self.set_debug_name(buffer, &format!("{name}-stage-buffer"));
            Ok((buffer, allocation))
        }
    }
}
impl GfxDevice for GfxContext {
    type CommandBuffer = GfxCommandBuffer;

    fn wait_idle(&self) -> GfxResult<()> {
        let _span = restir_crate_tools::profile_span!("GfxContext::wait_idle");
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }

    fn create_fence(&self, signaled: bool, debug_name: &str) -> GfxResult<GfxFence> {
        let fence_flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default().flags(fence_flags), None)? };
        self.set_debug_name(fence, debug_name);
        Ok(GfxFence::from_handle(fence, debug_name))
    }

    fn wait_fence(&self, fence: &GfxFence) -> GfxResult<()> {
        unsafe {
            self.device.wait_for_fences(std::slice::from_ref(&fence.handle()), true, u64::MAX)?;
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: &GfxFence) -> GfxResult<bool> {
        Ok(unsafe { self.device.get_fence_status(fence.handle())? })
    }

    fn reset_fence(&self, fence: &GfxFence) -> GfxResult<()> {
        unsafe {
            self.device.reset_fences(std::slice::from_ref(&fence.handle()))?;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: GfxFence) {
        unsafe {
            self.device.destroy_fence(fence.handle(), None);
        }
    }

    fn begin_commands(&self, frame_slot: usize, debug_name: &str) -> GfxResult<GfxCommandBuffer> {
        let slot = self.frame_slots.get(frame_slot).ok_or(GfxError::InvalidFrameSlot(frame_slot))?;
        unsafe {
            self.device.reset_command_pool(slot.pool, vk::CommandPoolResetFlags::empty())?;
        }

        let mut command_buffer =
            GfxCommandBuffer::new(slot.command_buffer, self.device.clone(), self.debug_utils.clone(), debug_name);
        command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        Ok(command_buffer)
    }

    fn submit(&self, mut cmd: GfxCommandBuffer, fence: &GfxFence) -> GfxResult<()> {
        let _span = restir_crate_tools::profile_span!("GfxContext::submit");
        cmd.end()?;

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd.vk_handle())];
        unsafe {
            self.device.queue_submit2(
                self.queue,
                &[vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos)],
                fence.handle(),
            )?;
        }
        Ok(())
    }

    fn create_device_local_buffer(&self, desc: &GfxBufferDesc) -> GfxResult<GfxBuffer> {
        if desc.size == 0 {
            return Err(GfxError::ZeroSizedBuffer(desc.name.clone()));
        }

        let buffer_ci = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // 不带 HOST_ACCESS 标志，VMA 会选择 device local 且 host 不可见的内存
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: vk_mem::AllocationCreateFlags::empty(),
            ..Default::default()
        };

        let (buffer, allocation) = unsafe { self.allocator.create_buffer(&buffer_ci, &alloc_ci)? };
        self.set_debug_name(buffer, &format!("Buffer::{}", desc.name));
        self.buffer_allocations.borrow_mut().insert(buffer, allocation);

        Ok(GfxBuffer::new(buffer, desc))
    }

    fn upload_to_buffer(&self, buffer: &GfxBuffer, data: &[u8]) -> GfxResult<()> {
        let _span = restir_crate_tools::profile_span!("GfxContext::upload_to_buffer");
        if data.len() as vk::DeviceSize > buffer.size() {
            return Err(GfxError::UploadOverflow {
                name: buffer.debug_name().to_string(),
                data_size: data.len() as vk::DeviceSize,
                capacity: buffer.size(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        if !self.buffer_allocations.borrow().contains_key(&buffer.vk_buffer()) {
            return Err(GfxError::UnknownBuffer(buffer.debug_name().to_string()));
        }

        let (stage_buffer, mut stage_allocation) = self.create_stage_buffer(data, buffer.debug_name())?;
        let copy_result = self.one_time_exec(
            |cmd| {
                cmd.begin_label(&format!("upload-{}", buffer.debug_name()), LabelColor::COLOR_UPLOAD);
                cmd.cmd_copy_buffer(
                    stage_buffer,
                    buffer.vk_buffer(),
                    &[vk::BufferCopy {
                        size: data.len() as vk::DeviceSize,
                        ..Default::default()
                    }],
                );
                cmd.end_label();
            },
            &format!("{}-transfer-data", buffer.debug_name()),
        );
        unsafe {
            self.allocator.destroy_buffer(stage_buffer, &mut stage_allocation);
        }
        copy_result
    }

    fn destroy_buffer(&self, buffer: GfxBuffer) {
        let Some(mut allocation) = self.buffer_allocations.borrow_mut().remove(&buffer.vk_buffer()) else {
            log::warn!("destroy unknown buffer `{}`", buffer.debug_name());
            return;
        };
        unsafe {
            self.allocator.destroy_buffer(buffer.vk_buffer(), &mut allocation);
        }
    }

    fn create_sampled_image(&self, desc: &GfxImageDesc, texels: &[u8]) -> GfxResult<GfxImage> {
        let _span = restir_crate_tools::profile_span!("GfxContext::create_sampled_image");
        let expected = VulkanFormatUtils::pixel_size_in_bytes(desc.format).unwrap_or(0) * desc.texel_count();
        if expected == 0 || expected != texels.len() {
            return Err(GfxError::TexelSizeMismatch {
                name: desc.name.clone(),
                data_size: texels.len(),
                expected,
            });
        }

        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, mut allocation) = unsafe { self.allocator.create_image(&image_ci, &alloc_ci)? };
        self.set_debug_name(image, &format!("Image::{}", desc.name));

        let (stage_buffer, mut stage_allocation) = match self.create_stage_buffer(texels, &desc.name) {
            Ok(stage) => stage,
            Err(e) => {
                unsafe { self.allocator.destroy_image(image, &mut allocation) };
                return Err(e);
            }
        };

        let aspect = VulkanFormatUtils::infer_image_aspect(desc.format);
        let copy_result = self.one_time_exec(
            |cmd| {
                let to_transfer_dst = GfxImageBarrier::new()
                    .image(image)
                    .image_aspect_flag(aspect)
                    .layout_transfer(vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .mask(GfxBarrierMask {
                        src_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
                        dst_stage: vk::PipelineStageFlags2::TRANSFER,
                        src_access: vk::AccessFlags2::NONE,
                        dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                    });
                cmd.image_memory_barrier(vk::DependencyFlags::empty(), &[to_transfer_dst]);

                let regions = [vk::BufferImageCopy2::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: aspect,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(desc.extent)];
                cmd.cmd_copy_buffer_to_image(
                    &vk::CopyBufferToImageInfo2::default()
                        .src_buffer(stage_buffer)
                        .dst_image(image)
                        .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                        .regions(&regions),
                );

                let to_shader_read = GfxImageBarrier::new()
                    .image(image)
                    .image_aspect_flag(aspect)
                    .layout_transfer(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .mask(GfxBarrierMask {
                        src_stage: vk::PipelineStageFlags2::TRANSFER,
                        dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                        src_access: vk::AccessFlags2::TRANSFER_WRITE,
                        dst_access: vk::AccessFlags2::SHADER_SAMPLED_READ,
                    });
                cmd.image_memory_barrier(vk::DependencyFlags::empty(), &[to_shader_read]);
            },
            &format!("{}-upload", desc.name),
        );
        unsafe {
            self.allocator.destroy_buffer(stage_buffer, &mut stage_allocation);
        }
        if let Err(e) = copy_result {
            unsafe { self.allocator.destroy_image(image, &mut allocation) };
            return Err(e);
        }

        self.image_allocations.borrow_mut().insert(image, allocation);
        Ok(GfxImage::new_allocated(image, desc.clone()))
    }

    fn destroy_image(&self, image: GfxImage) {
        if image.source() == ImageSource::External {
            return;
        }
        let Some(mut allocation) = self.image_allocations.borrow_mut().remove(&image.handle()) else {
            log::warn!("destroy unknown image `{}`", image.name());
            return;
        };
        unsafe {
            self.allocator.destroy_image(image.handle(), &mut allocation);
        }
    }
}
// destroy
impl GfxContext {
    /// 释放 command pool 和所有残留的 allocation
    ///
    /// device 和 allocator 本身由调用方负责
    pub fn destroy(self) -> GfxResult<()> {
        unsafe {
            self.device.device_wait_idle()?;

            for (buffer, mut allocation) in self.buffer_allocations.borrow_mut().drain() {
                log::warn!("buffer {:?} is still alive when gfx context is destroyed", buffer);
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
            for (image, mut allocation) in self.image_allocations.borrow_mut().drain() {
                log::warn!("image {:?} is still alive when gfx context is destroyed", image);
                self.allocator.destroy_image(image, &mut allocation);
            }

            for slot in &self.frame_slots {
                self.device.destroy_command_pool(slot.pool, None);
            }
            self.device.destroy_command_pool(self.temp_pool, None);
        }
        Ok(())
    }
}
