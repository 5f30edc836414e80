use ash::{
    ext::debug_utils,
    khr::{surface, swapchain},
    vk, Device, Entry, Instance,
};
use glam::Vec4;
use std::borrow::Cow;
use std::{
    ffi::{c_void, CStr},
    os::raw::c_char,
};
use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::{ElementState, WindowEvent},
    event_loop::ActiveEventLoop,
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowAttributes, WindowId},
};

use crate::config::{AppConfig, SceneConfig};
use crate::error::{FrameError, InitError, LinkError};
use crate::frame::{frame_draws, srgb_to_linear, FrameClock, FrameState, Layer, LoopState};
use crate::geometry::{Geometry, GeometryBuffer};
use crate::pipeline::ShaderProgram;
use crate::shader::{self, Stage, UniformLocation, COLOR_UNIFORM, FRAGMENT_SOURCE, VERTEX_SOURCE};
use crate::sync::PerImage;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

struct Scene {
    program: ShaderProgram,
    color: UniformLocation,
    background: GeometryBuffer,
    foreground: GeometryBuffer,
}

impl Scene {
    fn new(
        instance: &Instance,
        pdevice: vk::PhysicalDevice,
        device: &Device,
        render_pass: vk::RenderPass,
        config: &SceneConfig,
    ) -> Result<Self, InitError> {
        let vertex = shader::compile(VERTEX_SOURCE, Stage::Vertex)?;
        let fragment = shader::compile(FRAGMENT_SOURCE, Stage::Fragment)?;
        let linked = shader::link(&vertex, &fragment)?;
        let background_points = Geometry::new(&config.background)?;
        let foreground_points = Geometry::new(&config.foreground)?;

        let Some(color) = linked.uniform(COLOR_UNIFORM) else {
            return Err(LinkError {
                log: format!("program has no `{COLOR_UNIFORM}` uniform"),
            }
            .into());
        };
        let program = ShaderProgram::new(device, render_pass, &linked)?;
        let background =
            match GeometryBuffer::upload(instance, pdevice, device, &background_points) {
                Ok(buffer) => buffer,
                Err(e) => {
                    program.destroy(device);
                    return Err(e);
                }
            };
        let foreground =
            match GeometryBuffer::upload(instance, pdevice, device, &foreground_points) {
                Ok(buffer) => buffer,
                Err(e) => {
                    program.destroy(device);
                    background.destroy(device);
                    return Err(e);
                }
            };
        Ok(Scene {
            program,
            color,
            background,
            foreground,
        })
    }

    fn geometry(&self, layer: Layer) -> &GeometryBuffer {
        match layer {
            Layer::Background => &self.background,
            Layer::Foreground => &self.foreground,
        }
    }

    fn destroy(&self, device: &Device) {
        self.program.destroy(device);
        self.background.destroy(device);
        self.foreground.destroy(device);
    }
}

struct App {
    // Keeps the Vulkan loader alive for as long as the instance.
    _entry: Entry,
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    window: Window,
    pdevice: vk::PhysicalDevice,
    device: Device,
    queue: vk::Queue,
    surface: vk::SurfaceKHR,
    surface_loader: surface::Instance,
    swapchain: vk::SwapchainKHR,
    swap_device: swapchain::Device,
    swap_img_views: Vec<vk::ImageView>,
    swap_framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    render_pass: vk::RenderPass,
    scene: Option<Scene>,
    command_pool: vk::CommandPool,
    command_buffers: Vec<vk::CommandBuffer>,
    image_available: Vec<vk::Semaphore>,
    render_done: PerImage<vk::Semaphore>,
    in_flight: Vec<vk::Fence>,
    cur_frame: usize,
    clock: FrameClock,
    clear_color: [f32; 4],
    // Set when the attachment encodes to sRGB on write.
    encodes_srgb: bool,
}

/// Owns the app once the event loop has resumed, plus the loop state and
/// the first fatal error.
pub struct WrappedApp {
    config: AppConfig,
    app: Option<App>,
    state: LoopState,
    fatal: Option<anyhow::Error>,
}

impl WrappedApp {
    pub fn new(config: AppConfig) -> Self {
        WrappedApp {
            config,
            app: None,
            state: LoopState::Running,
            fatal: None,
        }
    }

    /// The error that stopped the event loop, if any.
    pub fn take_error(&mut self) -> Option<anyhow::Error> {
        self.fatal.take()
    }

    // Logged here; `main` only turns it into the exit status.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{error:#}");
        self.fatal.get_or_insert(error);
        self.state.request_close();
        event_loop.exit();
    }
}

impl App {
    fn new(event_loop: &ActiveEventLoop, config: &AppConfig) -> Result<Self, InitError> {
        let window = event_loop.create_window(
            WindowAttributes::default()
                .with_inner_size(LogicalSize::new(
                    config.window.width as f64,
                    config.window.height as f64,
                ))
                .with_resizable(config.window.resizable)
                .with_title(config.window.title.as_str()),
        )?;
        let display_handle = window.display_handle()?.as_raw();
        let window_handle = window.window_handle()?.as_raw();
        let entry = Entry::linked();
        let validation = config.render.validation && App::has_validation_layer(&entry);
        let instance_result = {
            let layer_names_raw: Vec<*const c_char> = if validation {
                vec![VALIDATION_LAYER.as_ptr()]
            } else {
                Vec::new()
            };
            let app_info = vk::ApplicationInfo::default()
                .api_version(vk::make_api_version(0, 1, 0, 0))
                .application_name(c"triangle")
                .application_version(0)
                .engine_name(c"triangle")
                .engine_version(0);
            let mut extension_names = ash_window::enumerate_required_extensions(display_handle)
                .map_err(InitError::vk("enumerate required extensions"))?
                .to_vec();
            if validation {
                extension_names.push(debug_utils::NAME.as_ptr());
            }
            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_layer_names(&layer_names_raw)
                .enabled_extension_names(&extension_names)
                .flags(vk::InstanceCreateFlags::default());
            unsafe { entry.create_instance(&instance_info, None) }
        };
        let instance = instance_result.map_err(InitError::vk("create instance"))?;
        let debug = validation.then(|| App::create_debug_messenger(&entry, &instance)).flatten();
        let extension_names = [swapchain::NAME];
        let extension_names_raw = [swapchain::NAME.as_ptr()];
        let check_dev_props_valid = |props: &Vec<vk::ExtensionProperties>| {
            extension_names.iter().all(|e| {
                props
                    .iter()
                    .filter_map(|p| p.extension_name_as_c_str().ok())
                    .any(|name| name == *e)
            })
        };
        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .map_err(InitError::vk("create surface"))?;
        let (queue_ind, pdevice) = unsafe {
            let check_device = |d: vk::PhysicalDevice, i: u32, info: &vk::QueueFamilyProperties| {
                info.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                        && surface_loader
                            .get_physical_device_surface_support(d, i, surface)
                            .unwrap_or(false)
                        && instance
                            .enumerate_device_extension_properties(d)
                            .map(|props| check_dev_props_valid(&props))
                            .unwrap_or(false)
                        // only query support after verifying extensions
                        && App::get_swap_support(d, &surface_loader, surface)
                            .map(|(_, formats, modes)| !formats.is_empty() && !modes.is_empty())
                            .unwrap_or(false)
            };
            instance
                .enumerate_physical_devices()
                .map_err(InitError::vk("enumerate devices"))?
                .iter()
                .find_map(|d| {
                    instance
                        .get_physical_device_queue_family_properties(*d)
                        .iter()
                        .enumerate()
                        .find_map(|(i, info)| {
                            check_device(*d, i as u32, info).then(|| (i as u32, *d))
                        })
                })
                .ok_or(InitError::NoSuitableDevice)?
        };
        let device = unsafe {
            let q_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_priorities(&[1.0])
                .queue_family_index(queue_ind)];
            let features = instance.get_physical_device_features(pdevice);
            let device_info = vk::DeviceCreateInfo::default()
                .enabled_features(&features)
                .enabled_extension_names(&extension_names_raw)
                .queue_create_infos(&q_infos);
            instance
                .create_device(pdevice, &device_info, None)
                .map_err(InitError::vk("create device"))?
        };
        let swap_device = swapchain::Device::new(&instance, &device);
        let mut app = App::basic(
            entry,
            instance,
            debug,
            window,
            device,
            surface_loader,
            swap_device,
            config,
        );
        app.pdevice = pdevice;
        app.surface = surface;
        app.queue = unsafe { app.device.get_device_queue(queue_ind, 0) };
        app.log_device();
        app.create_swapchain()?;
        app.create_render_pass()?;
        app.create_framebuffers()?;
        app.scene = Some(Scene::new(
            &app.instance,
            app.pdevice,
            &app.device,
            app.render_pass,
            &config.scene,
        )?);

        unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                .queue_family_index(queue_ind);
            app.command_pool = app
                .device
                .create_command_pool(&pool_info, None)
                .map_err(InitError::vk("create command pool"))?;
            let buff_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(app.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(config.render.max_in_flight as u32);
            app.command_buffers = app
                .device
                .allocate_command_buffers(&buff_info)
                .map_err(InitError::vk("allocate command buffers"))?;

            let fence_create_info =
                vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
            for _ in 0..config.render.max_in_flight {
                app.image_available.push(
                    app.device
                        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                        .map_err(InitError::vk("create semaphore"))?,
                );
                app.in_flight.push(
                    app.device
                        .create_fence(&fence_create_info, None)
                        .map_err(InitError::vk("create fence"))?,
                );
            }
        }
        app.clock = FrameClock::new();
        Ok(app)
    }

    fn has_validation_layer(entry: &Entry) -> bool {
        let found = unsafe { entry.enumerate_instance_layer_properties() }
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| l.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER))
            })
            .unwrap_or(false);
        if !found {
            log::warn!("{VALIDATION_LAYER:?} not available, running without validation");
        }
        found
    }

    fn create_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let loader = debug_utils::Instance::new(entry, instance);
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));
        match unsafe { loader.create_debug_utils_messenger(&info, None) } {
            Ok(messenger) => Some((loader, messenger)),
            Err(e) => {
                log::warn!("debug messenger unavailable: {e}");
                None
            }
        }
    }

    fn log_device(&self) {
        let props = unsafe { self.instance.get_physical_device_properties(self.pdevice) };
        let name = props
            .device_name_as_c_str()
            .map(CStr::to_string_lossy)
            .unwrap_or(Cow::Borrowed("<unnamed>"));
        log::info!(
            "using {name}, Vulkan {}.{}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version),
        );
    }

    fn output_color(&self, color: Vec4) -> Vec4 {
        if self.encodes_srgb {
            srgb_to_linear(color)
        } else {
            color
        }
    }

    fn render(&mut self) -> Result<(), FrameError> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        let frame = self.cur_frame;
        let cmd = self.command_buffers[frame];
        let img_idx;
        let suboptimal;
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight[frame]], true, u64::MAX)
                .map_err(FrameError::vk("wait for frame fence"))?;
            match self.swap_device.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available[frame],
                vk::Fence::null(),
            ) {
                Ok((idx, stale)) => {
                    img_idx = idx;
                    suboptimal = stale;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("swapchain out of date, recreating");
                    self.recreate_swapchain()?;
                    return Ok(());
                }
                Err(e) => return Err(FrameError::vk("acquire next image")(e)),
            }
            // Only reset once work is certain to be submitted.
            self.device
                .reset_fences(&[self.in_flight[frame]])
                .map_err(FrameError::vk("reset frame fence"))?;
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(FrameError::vk("reset command buffer"))?;
            self.device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .map_err(FrameError::vk("begin command buffer"))?;
        }

        let state = FrameState::sample(&self.clock);
        let mut clear_color = [vk::ClearValue::default()];
        let clear = self.output_color(Vec4::from(self.clear_color));
        clear_color[0].color.float32 = clear.to_array();
        let pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.swap_framebuffers[img_idx as usize])
            .render_area(vk::Rect2D::default().extent(self.extent))
            .clear_values(&clear_color);
        let viewport = [vk::Viewport::default()
            .width(self.extent.width as f32)
            .height(self.extent.height as f32)
            .max_depth(1.0)];
        let scissor = [vk::Rect2D::default().extent(self.extent)];
        let mut draws = 0;
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
            if let Some(scene) = &self.scene {
                scene.program.bind(&self.device, cmd);
                self.device.cmd_set_viewport(cmd, 0, &viewport);
                self.device.cmd_set_scissor(cmd, 0, &scissor);
                for draw in frame_draws(state.c) {
                    let geometry = scene.geometry(draw.layer);
                    geometry.bind(&self.device, cmd);
                    let color = self.output_color(draw.color).to_array();
                    scene.program.push(&self.device, cmd, scene.color, bytemuck::bytes_of(&color));
                    self.device.cmd_draw(cmd, geometry.vertex_count(), 1, 0, 0);
                    draws += 1;
                }
            }
            self.device.cmd_end_render_pass(cmd);
            self.device
                .end_command_buffer(cmd)
                .map_err(FrameError::vk("end command buffer"))?;
        }
        log::trace!(
            "frame t={:.3}s c={:.3}: {draws} draws",
            state.time,
            state.c
        );

        let image_available = [self.image_available[frame]];
        let render_done = [self.render_done.for_image(img_idx)];
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&image_available)
            .signal_semaphores(&render_done)
            .wait_dst_stage_mask(&[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT])
            .command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], self.in_flight[frame])
                .map_err(FrameError::vk("submit frame"))?;
        }
        let swapchains = [self.swapchain];
        let img_idxs = [img_idx];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&render_done)
            .swapchains(&swapchains)
            .image_indices(&img_idxs);
        let presented = unsafe { self.swap_device.queue_present(self.queue, &present_info) };
        self.cur_frame = (self.cur_frame + 1) % self.command_buffers.len();
        match presented {
            Ok(false) if !suboptimal => Ok(()),
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::debug!("swapchain stale after present, recreating");
                Ok(self.recreate_swapchain()?)
            }
            Err(e) => Err(FrameError::vk("present")(e)),
        }
    }

    fn create_swapchain(&mut self) -> Result<(), InitError> {
        let (capabilities, formats, modes) =
            App::get_swap_support(self.pdevice, &self.surface_loader, self.surface)?;
        if self.format.format == vk::Format::UNDEFINED {
            self.format = pick_surface_format(&formats).ok_or(InitError::NoSuitableDevice)?;
            self.encodes_srgb = is_srgb(self.format.format);
            log::debug!(
                "surface format {:?}, encodes sRGB: {}",
                self.format.format,
                self.encodes_srgb
            );
        }
        self.extent = if capabilities.current_extent.width == u32::MAX {
            let size = self.window.inner_size();
            vk::Extent2D {
                width: size.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: size.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        } else {
            capabilities.current_extent
        };
        let mode = modes
            .iter()
            .find(|m| **m == vk::PresentModeKHR::MAILBOX)
            .copied()
            .unwrap_or(vk::PresentModeKHR::FIFO);
        let img_count = if capabilities.max_image_count == 0
            || capabilities.max_image_count > capabilities.min_image_count
        {
            capabilities.min_image_count + 1
        } else {
            capabilities.max_image_count
        };
        let info = vk::SwapchainCreateInfoKHR::default()
            .image_format(self.format.format)
            .present_mode(mode)
            .min_image_count(img_count)
            .image_extent(self.extent)
            .image_color_space(self.format.color_space)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&[])
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .clipped(true)
            .surface(self.surface)
            .old_swapchain(vk::SwapchainKHR::null());
        self.swapchain = unsafe { self.swap_device.create_swapchain(&info, None) }
            .map_err(InitError::vk("create swapchain"))?;
        let swap_imgs = unsafe { self.swap_device.get_swapchain_images(self.swapchain) }
            .map_err(InitError::vk("retrieve swapchain images"))?;
        for image in swap_imgs {
            let info = vk::ImageViewCreateInfo::default()
                .image(image)
                .format(self.format.format)
                .view_type(vk::ImageViewType::TYPE_2D)
                .components(
                    vk::ComponentMapping::default()
                        .r(vk::ComponentSwizzle::IDENTITY)
                        .g(vk::ComponentSwizzle::IDENTITY)
                        .b(vk::ComponentSwizzle::IDENTITY)
                        .a(vk::ComponentSwizzle::IDENTITY),
                )
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            let view = unsafe { self.device.create_image_view(&info, None) }
                .map_err(InitError::vk("create image view"))?;
            self.swap_img_views.push(view);
        }
        let device = &self.device;
        self.render_done
            .resize(
                self.swap_img_views.len(),
                || unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) },
                |semaphore| unsafe { device.destroy_semaphore(semaphore, None) },
            )
            .map_err(InitError::vk("create semaphore"))?;
        log::debug!(
            "swapchain {}x{}, {} images, {} present semaphores, {mode:?}",
            self.extent.width,
            self.extent.height,
            self.swap_img_views.len(),
            self.render_done.len()
        );
        Ok(())
    }

    fn create_render_pass(&mut self) -> Result<(), InitError> {
        let attachment_desc = [vk::AttachmentDescription::default()
            .format(self.format.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];
        let attachment_ref = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpass = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&attachment_ref)];
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachment_desc)
            .subpasses(&subpass)
            .dependencies(&dependencies);
        self.render_pass = unsafe { self.device.create_render_pass(&info, None) }
            .map_err(InitError::vk("create render pass"))?;
        Ok(())
    }

    fn create_framebuffers(&mut self) -> Result<(), InitError> {
        for view in &self.swap_img_views {
            let attachments = [*view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
                .map_err(InitError::vk("create swapchain framebuffer"))?;
            self.swap_framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<(), InitError> {
        let size = self.window.inner_size();
        if size.width == 0 || size.height == 0 {
            return Ok(());
        }
        let idle = unsafe { self.device.device_wait_idle() };
        idle.map_err(InitError::vk("wait for device"))?;
        self.clean_swapchain();
        self.create_swapchain()?;
        self.create_framebuffers()
    }

    fn clean_swapchain(&mut self) {
        unsafe {
            for framebuffer in self.swap_framebuffers.drain(..) {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for view in self.swap_img_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.swap_device.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    fn get_swap_support(
        pdevice: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<
        (
            vk::SurfaceCapabilitiesKHR,
            Vec<vk::SurfaceFormatKHR>,
            Vec<vk::PresentModeKHR>,
        ),
        InitError,
    > {
        unsafe {
            Ok((
                surface_loader
                    .get_physical_device_surface_capabilities(pdevice, surface)
                    .map_err(InitError::vk("get device surface capabilities"))?,
                surface_loader
                    .get_physical_device_surface_formats(pdevice, surface)
                    .map_err(InitError::vk("get device surface formats"))?,
                surface_loader
                    .get_physical_device_surface_present_modes(pdevice, surface)
                    .map_err(InitError::vk("get device surface modes"))?,
            ))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn basic(
        entry: Entry,
        instance: Instance,
        debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
        window: Window,
        device: Device,
        surface_loader: surface::Instance,
        swap_device: swapchain::Device,
        config: &AppConfig,
    ) -> Self {
        App {
            _entry: entry,
            instance,
            debug,
            window,
            pdevice: vk::PhysicalDevice::default(),
            device,
            queue: vk::Queue::default(),
            surface: vk::SurfaceKHR::default(),
            surface_loader,
            swapchain: vk::SwapchainKHR::default(),
            swap_device,
            swap_img_views: Vec::new(),
            swap_framebuffers: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            render_pass: vk::RenderPass::default(),
            scene: None,
            command_pool: vk::CommandPool::default(),
            command_buffers: Vec::new(),
            image_available: Vec::new(),
            render_done: PerImage::new(),
            in_flight: Vec::new(),
            cur_frame: 0,
            clock: FrameClock::new(),
            clear_color: config.render.clear_color,
            encodes_srgb: false,
        }
    }
}

// UNORM first: colours are written as given, like a default GL framebuffer.
fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let nonlinear = |f: &&vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
    formats
        .iter()
        .filter(nonlinear)
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM)
        .or_else(|| formats.iter().filter(nonlinear).find(|f| !is_srgb(f.format)))
        .or_else(|| formats.iter().find(|f| !is_srgb(f.format)))
        .or(formats.first())
        .copied()
}

fn is_srgb(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8_SRGB
            | vk::Format::R8G8_SRGB
            | vk::Format::R8G8B8_SRGB
            | vk::Format::B8G8R8_SRGB
            | vk::Format::R8G8B8A8_SRGB
            | vk::Format::B8G8R8A8_SRGB
            | vk::Format::A8B8G8R8_SRGB_PACK32
    )
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _: *mut c_void,
) -> vk::Bool32 {
    let message = if data.is_null() {
        Cow::Borrowed("")
    } else {
        (*data)
            .message_as_c_str()
            .map_or(Cow::Borrowed(""), CStr::to_string_lossy)
    };
    let level = if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Debug
    } else {
        log::Level::Trace
    };
    log::log!(target: "vulkan", level, "{kind:?}: {message}");
    vk::FALSE
}

impl ApplicationHandler for WrappedApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.app.is_some() {
            return;
        }
        match App::new(event_loop, &self.config) {
            Ok(app) => self.app = Some(app),
            Err(e) => self.fail(event_loop, anyhow::Error::new(e).context("initialization failed")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _: WindowId, event: WindowEvent) {
        let Some(app) = self.app.as_mut() else {
            log::debug!("no app yet, ignoring {event:?}");
            return;
        };
        match event {
            WindowEvent::Destroyed | WindowEvent::CloseRequested => self.state.request_close(),
            WindowEvent::KeyboardInput { event, .. } => self
                .state
                .handle_key(event.physical_key, event.state == ElementState::Pressed),
            WindowEvent::RedrawRequested => {
                if let Err(e) = app.render() {
                    self.fail(event_loop, anyhow::Error::new(e).context("rendering failed"));
                    return;
                }
            }
            _ => {}
        }
        if self.state.is_closing() {
            if let Err(e) = unsafe { app.device.device_wait_idle() } {
                log::warn!("device did not go idle before exit: {e}");
            }
            event_loop.exit();
        }
    }

    fn about_to_wait(&mut self, _: &ActiveEventLoop) {
        if let Some(app) = &self.app {
            if !self.state.is_closing() {
                app.window.request_redraw();
            }
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for semaphore in self.render_done.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for i in 0..self.in_flight.len() {
                self.device.destroy_semaphore(self.image_available[i], None);
                self.device.destroy_fence(self.in_flight[i], None);
            }
            self.device.destroy_command_pool(self.command_pool, None);
            if let Some(scene) = self.scene.take() {
                scene.destroy(&self.device);
            }
            self.clean_swapchain();
            self.device.destroy_render_pass(self.render_pass, None);
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_unorm_over_srgb() {
        let formats = [
            surface(vk::Format::B8G8R8A8_SRGB),
            surface(vk::Format::R8G8B8A8_SRGB),
            surface(vk::Format::B8G8R8A8_UNORM),
        ];
        let picked = pick_surface_format(&formats).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_UNORM);
        assert!(!is_srgb(picked.format));
    }

    #[test]
    fn takes_any_unorm_when_bgra_is_missing() {
        let formats = [
            surface(vk::Format::B8G8R8A8_SRGB),
            surface(vk::Format::R8G8B8A8_UNORM),
        ];
        let picked = pick_surface_format(&formats).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn falls_back_to_first_when_only_srgb() {
        let formats = [
            surface(vk::Format::R8G8B8A8_SRGB),
            surface(vk::Format::B8G8R8A8_SRGB),
        ];
        let picked = pick_surface_format(&formats).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_SRGB);
        assert!(is_srgb(picked.format));
        assert!(pick_surface_format(&[]).is_none());
    }
}
