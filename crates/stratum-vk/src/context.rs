// SPDX-License-Identifier: CEPL-1.0
//! Instance, validation and physical device selection.

use crate::error::{Error, Result, VkContext};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};
use stratum_core::Config;
use tracing::{debug, error, info, trace, warn};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

struct Messenger {
    loader: debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
    // read by the callback through the user-data pointer
    _abort_on_error: Box<bool>,
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    user: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe { data.as_ref() }
        .filter(|d| !d.p_message.is_null())
        .map(|d| unsafe { CStr::from_ptr(d.p_message) }.to_string_lossy())
        .unwrap_or_default();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("validation: {message}");
        let abort = unsafe { (user as *const bool).as_ref() }.copied().unwrap_or(false);
        if abort {
            std::process::abort();
        }
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("validation: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!("validation: {message}");
    } else {
        trace!("validation: {message}");
    }
    vk::FALSE
}

/// Extensions from `wanted` that `available` does not list.
pub fn missing_extensions<'a>(
    available: &[vk::ExtensionProperties],
    wanted: &[&'a CStr],
) -> Vec<&'a CStr> {
    wanted
        .iter()
        .copied()
        .filter(|w| {
            !available
                .iter()
                .any(|p| p.extension_name_as_c_str().is_ok_and(|name| name == *w))
        })
        .collect()
}

pub fn find_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

/// Loader, instance and optional debug messenger.
pub struct Context {
    pub entry: Entry,
    pub instance: Instance,
    pub surface_loader: surface::Instance,
    messenger: Option<Messenger>,
}

impl Context {
    pub fn new(config: &Config, display: RawDisplayHandle) -> Result<Self> {
        let entry = Entry::linked();

        let mut extensions: Vec<*const std::ffi::c_char> =
            ash_window::enumerate_required_extensions(display)
                .vk_op("enumerate_required_extensions")?
                .to_vec();
        let configured: Vec<CString> = config
            .instance_extensions
            .iter()
            .map(|e| CString::new(e.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Configuration(format!("instance extension name: {e}")))?;
        extensions.extend(configured.iter().map(|e| e.as_ptr()));

        let mut layers = Vec::new();
        if config.enable_validation_layers {
            let available = unsafe { entry.enumerate_instance_layer_properties() }
                .vk_op("vkEnumerateInstanceLayerProperties")?;
            let found = available
                .iter()
                .any(|l| l.layer_name_as_c_str().is_ok_and(|n| n == VALIDATION_LAYER));
            if !found {
                error!("validation requested but {VALIDATION_LAYER:?} is not installed");
                return Err(Error::MissingValidationLayer);
            }
            layers.push(VALIDATION_LAYER.as_ptr());
            extensions.push(debug_utils::NAME.as_ptr());
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"stratum")
            .engine_name(c"stratum")
            .api_version(vk::API_VERSION_1_2);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.vk_op("vkCreateInstance")?;
        info!(
            "vulkan instance created ({} extensions, validation {})",
            extensions.len(),
            if layers.is_empty() { "off" } else { "on" }
        );

        let messenger = if config.enable_validation_layers {
            match unsafe { create_messenger(&entry, &instance, config.abort_on_validation_error) } {
                Ok(m) => Some(m),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        Ok(Context {
            entry,
            instance,
            surface_loader,
            messenger,
        })
    }

    /// First device for which `predicate` holds.
    pub fn pick_physical_device(
        &self,
        mut predicate: impl FnMut(&Instance, vk::PhysicalDevice) -> bool,
    ) -> Result<vk::PhysicalDevice> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .vk_op("vkEnumeratePhysicalDevices")?;
        match devices.into_iter().find(|&p| predicate(&self.instance, p)) {
            Some(phys) => {
                info!("physical device: {}", self.device_name(phys));
                Ok(phys)
            }
            None => {
                error!("no physical device satisfies the selection predicate");
                Err(Error::NoPhysicalDevice)
            }
        }
    }

    /// True when `phys` advertises every extension in `extensions`.
    pub fn physical_device_able(&self, phys: vk::PhysicalDevice, extensions: &[&CStr]) -> bool {
        let available = match unsafe { self.instance.enumerate_device_extension_properties(phys) } {
            Ok(a) => a,
            Err(e) => {
                warn!("vkEnumerateDeviceExtensionProperties failed: {e:?}");
                return false;
            }
        };
        let missing = missing_extensions(&available, extensions);
        for ext in &missing {
            debug!("{} lacks {ext:?}", self.device_name(phys));
        }
        missing.is_empty()
    }

    pub fn device_name(&self, phys: vk::PhysicalDevice) -> String {
        let props = unsafe { self.instance.get_physical_device_properties(phys) };
        props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".into())
    }

    pub fn queue_families(
        &self,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<QueueFamilies> {
        let families =
            unsafe { self.instance.get_physical_device_queue_family_properties(phys) };
        let graphics = find_graphics_family(&families).ok_or(Error::NoQueueFamily("graphics"))?;
        let present = (0..families.len() as u32)
            .find(|&i| {
                unsafe {
                    self.surface_loader
                        .get_physical_device_surface_support(phys, i, surface)
                }
                .unwrap_or(false)
            })
            .ok_or(Error::NoQueueFamily("present"))?;
        Ok(QueueFamilies { graphics, present })
    }

    pub fn memory_properties(&self, phys: vk::PhysicalDevice) -> vk::PhysicalDeviceMemoryProperties {
        unsafe { self.instance.get_physical_device_memory_properties(phys) }
    }

    /// Destroy the messenger and the instance. Every object created from
    /// the instance must already be gone.
    pub fn destroy(mut self) {
        if let Some(m) = self.messenger.take() {
            unsafe { m.loader.destroy_debug_utils_messenger(m.handle, None) };
        }
        unsafe { self.instance.destroy_instance(None) };
        debug!("vulkan instance destroyed");
    }
}

unsafe fn create_messenger(entry: &Entry, instance: &Instance, abort_on_error: bool) -> Result<Messenger> {
    let abort = Box::new(abort_on_error);
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
        .pfn_user_callback(Some(debug_callback))
        .user_data(&*abort as *const bool as *mut c_void);
    let loader = debug_utils::Instance::new(entry, instance);
    let handle = unsafe { loader.create_debug_utils_messenger(&info, None) }
        .vk_op("vkCreateDebugUtilsMessengerEXT")?;
    Ok(Messenger {
        loader,
        handle,
        _abort_on_error: abort,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(name: &CStr) -> vk::ExtensionProperties {
        let mut p = vk::ExtensionProperties::default();
        for (dst, &src) in p.extension_name.iter_mut().zip(name.to_bytes()) {
            *dst = src as std::ffi::c_char;
        }
        p
    }

    #[test]
    fn reports_only_missing_extensions() {
        let available = [ext(c"VK_KHR_swapchain"), ext(c"VK_EXT_mesh_shader")];
        assert!(missing_extensions(&available, &[c"VK_KHR_swapchain"]).is_empty());
        assert_eq!(
            missing_extensions(&available, &[c"VK_KHR_swapchain", c"VK_KHR_ray_query"]),
            vec![c"VK_KHR_ray_query"]
        );
    }

    #[test]
    fn graphics_family_is_first_capable() {
        let fam = |flags| vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        };
        let families = [
            fam(vk::QueueFlags::TRANSFER),
            fam(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            fam(vk::QueueFlags::GRAPHICS),
        ];
        assert_eq!(find_graphics_family(&families), Some(1));
        assert_eq!(find_graphics_family(&families[..1]), None);
    }
}
