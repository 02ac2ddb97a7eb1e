use std::ffi::{CStr, CString};
use std::fmt::Debug;

use ash::vk;
use thiserror::Error;

/// Minimum severity forwarded from the validation layer to [`tracing`].
///
/// Ordered least to most severe.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    fn severity_mask(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            VulkanLogLevel::Verbose => S::VERBOSE | S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Warning => S::WARNING | S::ERROR,
            VulkanLogLevel::Error => S::ERROR,
        }
    }
}

/// `VK_MAKE_API_VERSION` value with accessors and `major.minor.patch`
/// display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(0, major, minor, patch))
    }

    pub fn major(self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Vulkan loader unavailable: {0}")]
    Loading(ash::LoadingError),
    #[error("Requested instance extensions are not available: {0:?}")]
    MissingExtensions(Vec<String>),
    #[error("Vulkan error during instance creation: {0}")]
    Vulkan(vk::Result),
    #[error("Application name contains an interior NUL byte")]
    InvalidAppName,
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::Vulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Out of memory while enumerating physical devices")]
    MemoryExhaustion,
    #[error("Vulkan error enumerating physical devices: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("VK_KHR_surface was not enabled on this instance")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying present support: {0}")]
    Vulkan(vk::Result),
}

/// Target used for validation layer messages.
pub const DEBUG_MESSENGER_TARGET: &str = "rgpu-debug-messenger";

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: The loader hands us a valid callback data pointer whose
    // message is a NUL-terminated string for the duration of the call.
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }
        .to_string_lossy();

    use vk::DebugUtilsMessageTypeFlagsEXT as T;
    let kind = if message_type.contains(T::VALIDATION) {
        "validation"
    } else if message_type.contains(T::PERFORMANCE) {
        "performance"
    } else {
        "general"
    };

    use vk::DebugUtilsMessageSeverityFlagsEXT as S;
    match message_severity {
        S::ERROR => tracing::error!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}"),
        S::WARNING => tracing::warn!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}"),
        S::INFO => tracing::info!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}"),
        S::VERBOSE => tracing::trace!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}"),
        _ => tracing::debug!(target: DEBUG_MESSENGER_TARGET, "[{kind}] {message}"),
    }

    vk::FALSE
}

/// The root Vulkan object.
///
/// Everything derived from an instance holds an `Arc<Instance>` to keep it
/// alive.
pub struct Instance {
    // Never read, but must outlive `handle`.
    _entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    surface_instance: Option<ash::khr::surface::Instance>,
    version: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((messenger, loader)) = self.debug_messenger.take() {
            // SAFETY: Created from this instance, last use.
            unsafe { loader.destroy_debug_utils_messenger(messenger, None) };
        }
        // SAFETY: Every derived object holds an Arc to us, so none remain.
        unsafe { self.handle.destroy_instance(None) };
    }
}

impl Instance {
    /// Load Vulkan and create an instance at the highest version the loader
    /// reports.
    ///
    /// `extensions` must all be available or creation fails. Validation and
    /// the debug messenger are enabled when `max_log_level` is set and the
    /// layer is installed; otherwise they are silently skipped.
    ///
    /// # Safety
    /// Loads the Vulkan library with `libloading`, which runs arbitrary
    /// initialization code.
    pub unsafe fn new(
        app_name: &str,
        max_log_level: Option<VulkanLogLevel>,
        extensions: &[&CStr],
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name = CString::new(app_name).map_err(|_| Error::InvalidAppName)?;
        // SAFETY: Caller accepts the library loading hazard. The entry is
        // stored in the Instance and outlives every object created from it.
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: Entry is live; the query has no other preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .ok()
            .flatten()
            .unwrap_or(vk::API_VERSION_1_0);

        // SAFETY: Entry is live; None queries the implementation's own
        // extensions.
        let available = unsafe { entry.enumerate_instance_extension_properties(None) }?;
        let has_ext = |name: &CStr| {
            available
                .iter()
                .any(|e| e.extension_name_as_c_str() == Ok(name))
        };

        let missing: Vec<_> = extensions
            .iter()
            .filter(|name| !has_ext(**name))
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingExtensions(missing));
        }

        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        // SAFETY: Entry is live.
        let has_validation = unsafe { entry.enumerate_instance_layer_properties() }
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| l.layer_name_as_c_str() == Ok(validation_layer))
            })
            .unwrap_or(false);

        let mut ext_ptrs: Vec<_> = extensions.iter().map(|e| e.as_ptr()).collect();
        let mut layer_ptrs = Vec::new();

        let mut messenger_info = match max_log_level {
            Some(level) if has_validation && has_ext(ash::ext::debug_utils::NAME) => {
                ext_ptrs.push(ash::ext::debug_utils::NAME.as_ptr());
                layer_ptrs.push(validation_layer.as_ptr());
                Some(
                    vk::DebugUtilsMessengerCreateInfoEXT::default()
                        .message_severity(level.severity_mask())
                        .message_type(
                            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                        )
                        .pfn_user_callback(Some(vulkan_debug_callback)),
                )
            }
            Some(_) => {
                tracing::warn!(
                    "Validation requested but VK_LAYER_KHRONOS_validation or \
                     VK_EXT_debug_utils is unavailable"
                );
                None
            }
            None => None,
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"rgpu-sched")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&ext_ptrs)
            .enabled_layer_names(&layer_ptrs);
        // Chained so instance creation and destruction are covered too.
        if let Some(info) = messenger_info.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info and everything it points to is alive for the
        // call.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let debug_messenger = match messenger_info {
            Some(mut info) => {
                info.p_next = std::ptr::null();
                let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
                // SAFETY: info is a complete create info with no chain.
                match unsafe { loader.create_debug_utils_messenger(&info, None) } {
                    Ok(messenger) => Some((messenger, loader)),
                    Err(e) => {
                        tracing::error!(
                            "Could not create debug messenger, continuing \
                             without one: {e}"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        let surface_instance = extensions
            .contains(&ash::khr::surface::NAME)
            .then(|| ash::khr::surface::Instance::new(&entry, &handle));

        let version = VkVersion::from_raw(api_version);
        tracing::info!("Created Vulkan {version} instance");
        Ok(Self {
            _entry: entry,
            handle,
            debug_messenger,
            surface_instance,
            version,
        })
    }

    /// Physical device handles, valid only with this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: The instance is live.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(devices) => Ok(devices),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::Vulkan(e)),
        }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: Caller guarantees provenance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must come from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: Caller guarantees provenance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// Whether `family` of `physical_device` can present to `surface`.
    ///
    /// # Safety
    /// `physical_device` and `surface` must come from this instance.
    pub unsafe fn get_raw_physical_device_surface_support(
        &self,
        physical_device: vk::PhysicalDevice,
        family: u32,
        surface: vk::SurfaceKHR,
    ) -> Result<bool, SurfaceSupportError> {
        let Some(loader) = self.surface_instance.as_ref() else {
            return Err(SurfaceSupportError::ExtensionNotLoaded);
        };
        // SAFETY: Caller guarantees provenance.
        unsafe {
            loader.get_physical_device_surface_support(physical_device, family, surface)
        }
        .map_err(SurfaceSupportError::Vulkan)
    }

    /// # Safety
    /// `physical_device` must come from this instance, and `create_info` and
    /// everything it points to must be valid for the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees provenance and create info validity.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }

    /// Version reported by `vkEnumerateInstanceVersion`.
    pub fn supported_ver(&self) -> VkVersion {
        self.version
    }

    pub fn has_debug_messenger(&self) -> bool {
        self.debug_messenger.is_some()
    }

    pub fn raw_instance(&self) -> vk::Instance {
        self.handle.handle()
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_components_and_display() {
        let version = VkVersion::new(1, 3, 275);
        assert_eq!(version.major(), 1);
        assert_eq!(version.minor(), 3);
        assert_eq!(version.patch(), 275);
        assert_eq!(version.to_string(), "1.3.275");
        assert!(VkVersion::new(1, 2, 0) < version);
    }

    #[test]
    fn stricter_levels_forward_fewer_severities() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(VulkanLogLevel::Error.severity_mask(), S::ERROR);
        assert!(VulkanLogLevel::Verbose.severity_mask().contains(S::VERBOSE));
        assert!(!VulkanLogLevel::Info.severity_mask().contains(S::VERBOSE));
        assert!(VulkanLogLevel::Warning < VulkanLogLevel::Error);
    }
}
