#[cfg(unix)]
mod containment;
#[cfg(unix)]
mod unix_process_manager;

#[cfg(unix)]
pub use unix_process_manager::UnixProcessManager;

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl warden_core::PlatformManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_platform_manager(
        config: &warden_core::SupervisorConfig,
    ) -> anyhow::Result<Self::Manager> {
        UnixProcessManager::new(config)
    }

    fn platform_name() -> &'static str {
        "unix"
    }
}
