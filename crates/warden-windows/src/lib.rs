#[cfg(windows)]
mod job_object;
#[cfg(windows)]
mod windows_process_manager;

#[cfg(windows)]
pub use windows_process_manager::WindowsProcessManager;

#[cfg(windows)]
pub struct WindowsProcessManagerFactory;

#[cfg(windows)]
impl warden_core::PlatformManagerFactory for WindowsProcessManagerFactory {
    type Manager = WindowsProcessManager;

    fn create_platform_manager(
        config: &warden_core::SupervisorConfig,
    ) -> anyhow::Result<Self::Manager> {
        WindowsProcessManager::new(config)
    }

    fn platform_name() -> &'static str {
        "windows"
    }
}
