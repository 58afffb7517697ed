//! Explicit-image rendering back-end.
//!
//! A raw ash-based Vulkan context for callers that composite with their own
//! Vulkan renderer instead of wgpu. Imports GPU buffers as external-memory
//! images with explicit per-plane layouts and hands out the image, its
//! dedicated memory and a sampled view. Ownership of buffers crossing from
//! the allocating device is transferred with a queue-family acquire barrier
//! from `QUEUE_FAMILY_FOREIGN_EXT`.
//!
//! Shared-memory buffers are not handled here; callers with a Vulkan
//! renderer upload those through their own staging path.

use std::ffi::CStr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use ash::vk;
use tracing::{debug, info, trace};

use crate::buffer::{Buffer, DmaBuffer};
use crate::error::{BridgeError, ImportError};
use crate::formats;

/// Device extensions the import path cannot work without.
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 5] = [
    ash::khr::external_memory::NAME,
    ash::khr::external_memory_fd::NAME,
    ash::ext::external_memory_dma_buf::NAME,
    ash::ext::image_drm_format_modifier::NAME,
    ash::ext::queue_family_foreign::NAME,
];

/// Explicit-layout images carry at most this many memory planes.
const MAX_PLANES: usize = 4;

/// Owned Vulkan context shared by the bridge and every image it imports.
///
/// Destruction order matters: images drop their handles first (they hold an
/// `Arc` to this), then the last reference waits the device idle and tears
/// down device and instance.
struct VulkanShared {
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    queue: vk::Queue,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl Drop for VulkanShared {
    fn drop(&mut self) {
        // SAFETY: all images holding this context are gone, so no handle
        // created from this device is still alive.
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// The raw-Vulkan rendering back-end.
pub struct VulkanBridge {
    shared: Arc<VulkanShared>,
}

impl VulkanBridge {
    /// Create a bridge on a fresh Vulkan device with the import extensions
    /// enabled.
    ///
    /// Fails with [`BridgeError::MissingExtension`] if no physical device
    /// exposes the full external-memory import set.
    pub fn new() -> Result<Self, BridgeError> {
        info!("creating raw Vulkan back-end");

        // SAFETY: loading the system Vulkan library has no preconditions.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BridgeError::InstanceCreation(format!("failed to load Vulkan: {e}")))?;

        let instance_extensions: Vec<*const i8> = vec![
            ash::khr::get_physical_device_properties2::NAME.as_ptr(),
            ash::khr::external_memory_capabilities::NAME.as_ptr(),
        ];

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"lamco-swapchain")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions);

        // SAFETY: instance_create_info is valid and outlives the call.
        let instance = unsafe { entry.create_instance(&instance_create_info, None) }
            .map_err(|e| BridgeError::InstanceCreation(format!("{e:?}")))?;

        match Self::create_device(&entry, instance.clone()) {
            Ok(bridge) => Ok(bridge),
            Err(e) => {
                // SAFETY: nothing was created from the instance on this path.
                unsafe { instance.destroy_instance(None) };
                Err(e)
            }
        }
    }

    fn create_device(entry: &ash::Entry, instance: ash::Instance) -> Result<Self, BridgeError> {
        // SAFETY: instance is valid.
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| BridgeError::AdapterCreation(format!("{e:?}")))?;
        if physical_devices.is_empty() {
            return Err(BridgeError::AdapterCreation("no Vulkan devices".into()));
        }

        // First device with all import extensions, discrete GPUs preferred.
        let mut candidate = None;
        for &pd in &physical_devices {
            match Self::missing_extension(&instance, pd) {
                Some(name) => {
                    debug!("skipping device without {name:?}");
                }
                None => {
                    // SAFETY: instance and pd are valid.
                    let props = unsafe { instance.get_physical_device_properties(pd) };
                    if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                        candidate = Some(pd);
                        break;
                    }
                    candidate.get_or_insert(pd);
                }
            }
        }
        let physical_device = candidate.ok_or_else(|| {
            BridgeError::MissingExtension(format!(
                "no device exposes {}",
                ash::ext::image_drm_format_modifier::NAME.to_string_lossy()
            ))
        })?;

        // SAFETY: instance and physical_device are valid.
        let device_props = unsafe { instance.get_physical_device_properties(physical_device) };
        // SAFETY: device_name is null-terminated by Vulkan spec.
        let device_name =
            unsafe { CStr::from_ptr(device_props.device_name.as_ptr()).to_string_lossy() };
        info!("selected Vulkan device: {device_name}");

        // SAFETY: instance and physical_device are valid.
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family_index = queue_families
            .iter()
            .position(|qf| qf.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .ok_or_else(|| BridgeError::AdapterCreation("no graphics queue family".into()))?
            as u32;

        let device_extensions: Vec<*const i8> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let queue_priority = 1.0f32;
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(std::slice::from_ref(&queue_priority));

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&device_extensions);

        // SAFETY: instance, physical_device, and device_create_info are valid.
        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| BridgeError::DeviceCreation(format!("{e:?}")))?;

        // SAFETY: queue_family_index was used in device creation.
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        // SAFETY: instance and physical_device are valid.
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        Ok(VulkanBridge {
            shared: Arc::new(VulkanShared {
                entry: entry.clone(),
                instance,
                device,
                physical_device,
                queue_family_index,
                queue,
                memory_properties,
            }),
        })
    }

    /// Name of the first required extension `pd` lacks, or `None`.
    fn missing_extension(
        instance: &ash::Instance,
        pd: vk::PhysicalDevice,
    ) -> Option<&'static CStr> {
        // SAFETY: instance and pd are valid.
        let available = match unsafe { instance.enumerate_device_extension_properties(pd) } {
            Ok(exts) => exts,
            Err(_) => return Some(REQUIRED_DEVICE_EXTENSIONS[0]),
        };
        REQUIRED_DEVICE_EXTENSIONS.into_iter().find(|required| {
            !available.iter().any(|ext| {
                // SAFETY: extension_name is null-terminated by Vulkan spec.
                (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == *required
            })
        })
    }

    /// The logical device.
    pub fn device(&self) -> &ash::Device {
        &self.shared.device
    }

    /// The physical device the logical device was created on.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.shared.physical_device
    }

    /// The graphics queue.
    pub fn queue(&self) -> vk::Queue {
        self.shared.queue
    }

    /// Index of the graphics queue family.
    pub fn queue_family_index(&self) -> u32 {
        self.shared.queue_family_index
    }

    /// Import a GPU buffer as an external-memory image.
    ///
    /// All planes are assumed to alias one memory object, which is how the
    /// allocator exports them; plane 0's fd is the one imported. The image
    /// is created in `UNDEFINED` layout owned by the foreign queue family;
    /// record [`record_acquire_barrier`](VulkanBridge::record_acquire_barrier)
    /// before sampling from it.
    ///
    /// # Safety
    ///
    /// The buffer's exported fds must stay valid until the returned image is
    /// dropped, and the buffer must not be written while the GPU reads it.
    pub unsafe fn import_image(&self, buffer: &DmaBuffer) -> Result<VulkanImage, ImportError> {
        let width = buffer.width;
        let height = buffer.height;
        if width == 0 || height == 0 {
            return Err(ImportError::InvalidDimensions { width, height });
        }

        let vk_format = formats::fourcc_to_vk(buffer.fourcc)
            .ok_or(ImportError::UnsupportedFormat(buffer.fourcc))?;

        let planes = buffer.planes();
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return Err(ImportError::InvalidPlanes(format!(
                "expected 1..={MAX_PLANES} planes, got {}",
                planes.len()
            )));
        }

        let modifier = if formats::is_implicit(buffer.modifier) {
            u64::from(drm_fourcc::DrmModifier::Linear)
        } else {
            u64::from(buffer.modifier)
        };

        debug!(
            width,
            height,
            fourcc = ?buffer.fourcc,
            modifier = format_args!("{modifier:#x}"),
            planes = planes.len(),
            "importing dmabuf as Vulkan image"
        );

        let device = &self.shared.device;

        let plane_layouts: Vec<vk::SubresourceLayout> = planes
            .iter()
            .map(|plane| vk::SubresourceLayout {
                offset: plane.offset as u64,
                size: 0,
                row_pitch: plane.stride as u64,
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect();

        let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut modifier_explicit_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(modifier)
            .plane_layouts(&plane_layouts);

        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external_memory_info)
            .push_next(&mut modifier_explicit_info);

        // SAFETY: device is valid and image_create_info is fully initialized.
        let image = unsafe { device.create_image(&image_create_info, None) }
            .map_err(|e| ImportError::ImageCreation(format!("vkCreateImage failed: {e:?}")))?;

        // SAFETY: device and image are valid.
        let mem_requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = match find_memory_type_index(
            &self.shared.memory_properties,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Some(index) => index,
            None => {
                // SAFETY: image was created above and is unused.
                unsafe { device.destroy_image(image, None) };
                return Err(ImportError::MemoryImport(
                    "no suitable memory type found".into(),
                ));
            }
        };

        // Dup because vkImportMemoryFdKHR takes ownership on success.
        // SAFETY: plane fds are valid for the buffer's lifetime.
        let import_fd = unsafe {
            let duped = libc::dup(planes[0].fd.as_raw_fd());
            if duped < 0 {
                device.destroy_image(image, None);
                return Err(ImportError::FdImport("failed to dup dmabuf fd".into()));
            }
            duped
        };

        let mut import_memory_fd_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(import_fd);
        let mut dedicated_alloc_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let memory_allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index as u32)
            .push_next(&mut import_memory_fd_info)
            .push_next(&mut dedicated_alloc_info);

        // SAFETY: on success Vulkan owns import_fd; on failure it is closed here.
        let memory = match unsafe { device.allocate_memory(&memory_allocate_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: both handles are valid and unused elsewhere.
                unsafe {
                    device.destroy_image(image, None);
                    libc::close(import_fd);
                }
                return Err(ImportError::MemoryImport(format!(
                    "vkAllocateMemory failed: {e:?}"
                )));
            }
        };

        // SAFETY: device, image and memory are valid.
        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            // SAFETY: both objects were created above and are not in use.
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(ImportError::MemoryImport(format!(
                "vkBindImageMemory failed: {e:?}"
            )));
        }

        let view_create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(vk_format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        // SAFETY: device and the bound image are valid.
        let view = match unsafe { device.create_image_view(&view_create_info, None) } {
            Ok(view) => view,
            Err(e) => {
                // SAFETY: both objects were created above and are not in use.
                unsafe {
                    device.free_memory(memory, None);
                    device.destroy_image(image, None);
                }
                return Err(ImportError::ImageCreation(format!(
                    "vkCreateImageView failed: {e:?}"
                )));
            }
        };

        trace!("imported dmabuf as Vulkan image with {} planes", planes.len());

        Ok(VulkanImage {
            shared: self.shared.clone(),
            image,
            memory,
            view,
            format: vk_format,
            width,
            height,
            acquired: false,
        })
    }

    /// Record the queue-family acquire barrier for a freshly imported image.
    ///
    /// Transfers ownership from `QUEUE_FAMILY_FOREIGN_EXT` to this bridge's
    /// graphics family and moves the image from `GENERAL` (the layout the
    /// producing device leaves external images in) to
    /// `SHADER_READ_ONLY_OPTIMAL`. Must be recorded once per import, before
    /// the first draw that samples the image.
    ///
    /// # Safety
    ///
    /// `cmd` must be a command buffer in the recording state, allocated from
    /// a pool of this bridge's graphics queue family.
    pub unsafe fn record_acquire_barrier(&self, cmd: vk::CommandBuffer, image: &mut VulkanImage) {
        if image.acquired {
            return;
        }

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .old_layout(vk::ImageLayout::GENERAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_FOREIGN_EXT)
            .dst_queue_family_index(self.shared.queue_family_index)
            .image(image.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        // SAFETY: caller guarantees cmd is recording on this device.
        unsafe {
            self.shared.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            );
        }
        image.acquired = true;
    }
}

impl std::fmt::Debug for VulkanBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBridge")
            .field("queue_family_index", &self.shared.queue_family_index)
            .finish()
    }
}

/// An imported external-memory image with its dedicated allocation and a
/// sampled color view.
///
/// Dropping the image destroys the view, image and memory in that order;
/// the Vulkan context stays alive until the last image and the bridge are
/// both gone.
pub struct VulkanImage {
    shared: Arc<VulkanShared>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
    width: u32,
    height: u32,
    acquired: bool,
}

impl VulkanImage {
    /// The raw image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// A 2D color view over the whole image.
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// The Vulkan format the image was created with.
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Whether the acquire barrier has already been recorded.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for VulkanImage {
    fn drop(&mut self) {
        // SAFETY: the handles were created on this device and the caller
        // contract requires GPU work using them to have completed.
        unsafe {
            self.shared.device.destroy_image_view(self.view, None);
            self.shared.device.destroy_image(self.image, None);
            self.shared.device.free_memory(self.memory, None);
        }
    }
}

impl std::fmt::Debug for VulkanImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("acquired", &self.acquired)
            .finish()
    }
}

fn find_memory_type_index(
    mem_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required_flags: vk::MemoryPropertyFlags,
) -> Option<usize> {
    (0..mem_properties.memory_type_count as usize).find(|&i| {
        let type_bit = 1u32 << i;
        (type_bits & type_bit) != 0
            && (mem_properties.memory_types[i].property_flags & required_flags) == required_flags
    })
}

/// Imported-image cache for one swapchain slot.
///
/// Re-imports only when the slot's buffer identity changes; shared-memory
/// buffers are rejected since this back-end has no upload path.
#[derive(Default)]
pub struct SlotImage {
    buffer: Weak<Buffer>,
    image: Option<VulkanImage>,
}

impl SlotImage {
    /// An empty slot with nothing imported.
    pub fn new() -> Self {
        SlotImage::default()
    }

    /// The cached image, if any.
    pub fn image(&self) -> Option<&VulkanImage> {
        self.image.as_ref()
    }

    /// Mutable access for barrier recording.
    pub fn image_mut(&mut self) -> Option<&mut VulkanImage> {
        self.image.as_mut()
    }

    /// Make the cached image reflect `buffer`, importing if needed.
    ///
    /// # Safety
    ///
    /// Same requirements as [`VulkanBridge::import_image`], and any GPU work
    /// reading the previously cached image must have completed, since a
    /// changed buffer drops it here.
    pub unsafe fn sync(
        &mut self,
        buffer: &Arc<Buffer>,
        bridge: &VulkanBridge,
    ) -> Result<&mut VulkanImage, ImportError> {
        let dma = buffer
            .as_dma()
            .ok_or_else(|| ImportError::InvalidPlanes("not a GPU buffer".into()))?;

        let unchanged = self
            .buffer
            .upgrade()
            .map(|held| Arc::ptr_eq(&held, buffer))
            .unwrap_or(false);

        if !unchanged || self.image.is_none() {
            trace!("slot buffer changed, importing");
            self.image = None;
            let image = unsafe { bridge.import_image(dma) }?;
            self.buffer = Arc::downgrade(buffer);
            self.image = Some(image);
        }

        match &mut self.image {
            Some(image) => Ok(image),
            // Unreachable: the branch above always fills the slot.
            None => Err(ImportError::BridgeUnavailable),
        }
    }

    /// Drop the cached image, forcing a re-import on the next sync.
    ///
    /// # Safety
    ///
    /// Any GPU work reading the cached image must have completed.
    pub unsafe fn invalidate(&mut self) {
        self.buffer = Weak::new();
        self.image = None;
    }
}

impl std::fmt::Debug for SlotImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotImage")
            .field("imported", &self.image.is_some())
            .finish()
    }
}
