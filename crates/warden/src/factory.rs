use anyhow::Result;
use warden_core::{PlatformManagerFactory, SupervisorConfig};

/// Platform-independent factory that selects the appropriate implementation at compile time
pub struct PlatformFactory;

impl PlatformManagerFactory for PlatformFactory {
    #[cfg(unix)]
    type Manager = warden_unix::UnixProcessManager;

    #[cfg(windows)]
    type Manager = warden_windows::WindowsProcessManager;

    fn create_platform_manager(config: &SupervisorConfig) -> Result<Self::Manager> {
        #[cfg(unix)]
        return warden_unix::UnixProcessManagerFactory::create_platform_manager(config);

        #[cfg(windows)]
        return warden_windows::WindowsProcessManagerFactory::create_platform_manager(config);
    }

    fn platform_name() -> &'static str {
        #[cfg(unix)]
        return warden_unix::UnixProcessManagerFactory::platform_name();

        #[cfg(windows)]
        return warden_windows::WindowsProcessManagerFactory::platform_name();
    }
}

/// Platform manager of the current OS
pub type PlatformManagerImpl = <PlatformFactory as PlatformManagerFactory>::Manager;
