//! Two-phase creation contract shared by every device-bound resource.
//!
//! A resource is constructed as a plain value holding its creation
//! descriptor, then materialized with [`HardwareResource::create_on_hardware`]
//! and released with [`HardwareResource::destroy_from_hardware`]. The
//! [`Lifecycle`] tracker records which phase a resource is in and reports
//! resources that are dropped while still alive on the GPU.

use crate::error::{GpuError, Result};

/// Phase of a device-bound resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Descriptor stored, no native handle yet.
    Uninitialized,
    /// Native handle exists.
    Created,
    /// Native handle was released.
    Destroyed,
}

/// Lifecycle tracker embedded in every resource.
#[derive(Debug)]
pub struct Lifecycle {
    identifier: String,
    state: LifecycleState,
    ever_created: bool,
}

impl Lifecycle {
    /// Create a tracker for a resource named `identifier`.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            state: LifecycleState::Uninitialized,
            ever_created: false,
        }
    }

    /// Diagnostic name of the resource.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Current phase.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether a native handle currently exists.
    pub fn is_created(&self) -> bool {
        self.state == LifecycleState::Created
    }

    /// Whether the resource reached the created phase at least once.
    pub fn was_created(&self) -> bool {
        self.ever_created
    }

    /// Whether the native handle has been released.
    pub fn is_destroyed(&self) -> bool {
        self.state == LifecycleState::Destroyed
    }

    /// Record a successful hardware creation.
    pub fn mark_created(&mut self) {
        tracing::trace!(resource = %self.identifier, "created on hardware");
        self.state = LifecycleState::Created;
        self.ever_created = true;
    }

    /// Record the release of the native handle.
    pub fn mark_destroyed(&mut self) {
        if self.state == LifecycleState::Created {
            tracing::trace!(resource = %self.identifier, "destroyed from hardware");
        }
        self.state = LifecycleState::Destroyed;
    }

    /// Fail unless the resource is created.
    pub fn ensure_created(&self) -> Result<()> {
        if self.is_created() {
            Ok(())
        } else {
            Err(GpuError::NotCreated(self.identifier.clone()))
        }
    }

    /// Fail if the resource is already created.
    pub fn ensure_not_created(&self) -> Result<()> {
        if self.is_created() {
            tracing::error!(resource = %self.identifier, "create_on_hardware called twice");
            Err(GpuError::AlreadyCreated(self.identifier.clone()))
        } else {
            Ok(())
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        match self.state {
            LifecycleState::Created => {
                tracing::error!(
                    resource = %self.identifier,
                    "resource dropped while still created on hardware"
                );
            }
            LifecycleState::Uninitialized => {
                tracing::debug!(resource = %self.identifier, "resource dropped without ever being created");
            }
            LifecycleState::Destroyed => {}
        }
    }
}

/// Contract implemented by every GPU-bound resource.
pub trait HardwareResource {
    /// Lifecycle tracker of the resource.
    fn lifecycle(&self) -> &Lifecycle;

    /// Create the native object from the stored descriptor.
    ///
    /// Fails without side effects if the resource is already created or
    /// the device is unusable. Partial construction is rolled back.
    fn create_on_hardware(&mut self) -> Result<()>;

    /// Release the native object.
    ///
    /// Succeeds as a no-op on a never-created or already-destroyed resource.
    fn destroy_from_hardware(&mut self) -> Result<()>;

    /// Destroy then create again from the (possibly updated) descriptor.
    fn recreate(&mut self) -> Result<()> {
        self.destroy_from_hardware()?;
        self.create_on_hardware()
    }

    /// Diagnostic name.
    fn identifier(&self) -> &str {
        self.lifecycle().identifier()
    }

    /// Whether a native handle currently exists.
    fn is_created(&self) -> bool {
        self.lifecycle().is_created()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeResource {
        lifecycle: Lifecycle,
        handle: u64,
        next_handle: u64,
        fail_next_create: bool,
    }

    impl FakeResource {
        fn new() -> Self {
            Self {
                lifecycle: Lifecycle::new("fake"),
                handle: 0,
                next_handle: 1,
                fail_next_create: false,
            }
        }
    }

    impl HardwareResource for FakeResource {
        fn lifecycle(&self) -> &Lifecycle {
            &self.lifecycle
        }

        fn create_on_hardware(&mut self) -> Result<()> {
            self.lifecycle.ensure_not_created()?;
            if self.fail_next_create {
                self.fail_next_create = false;
                return Err(GpuError::Other("rejected".to_string()));
            }
            self.handle = self.next_handle;
            self.next_handle += 1;
            self.lifecycle.mark_created();
            Ok(())
        }

        fn destroy_from_hardware(&mut self) -> Result<()> {
            self.handle = 0;
            self.lifecycle.mark_destroyed();
            Ok(())
        }
    }

    #[test]
    fn create_then_destroy_nulls_the_handle() {
        let mut resource = FakeResource::new();
        resource.create_on_hardware().unwrap();
        assert_eq!(resource.handle, 1);
        resource.destroy_from_hardware().unwrap();

        assert_eq!(resource.handle, 0);
        assert!(resource.lifecycle().was_created());
        assert!(resource.lifecycle().is_destroyed());

        resource.destroy_from_hardware().unwrap();
        assert_eq!(resource.lifecycle().state(), LifecycleState::Destroyed);
    }

    #[test]
    fn destroy_without_create_is_noop() {
        let mut resource = FakeResource::new();
        assert!(resource.destroy_from_hardware().is_ok());
        assert!(!resource.lifecycle().was_created());
    }

    #[test]
    fn double_create_is_rejected() {
        let mut resource = FakeResource::new();
        resource.create_on_hardware().unwrap();
        let err = resource.create_on_hardware().unwrap_err();
        assert!(matches!(err, GpuError::AlreadyCreated(_)));
        assert_eq!(resource.handle, 1);
        resource.destroy_from_hardware().unwrap();
    }

    #[test]
    fn recreate_replaces_handle() {
        let mut resource = FakeResource::new();
        resource.create_on_hardware().unwrap();
        resource.recreate().unwrap();
        assert_eq!(resource.handle, 2);
        assert!(resource.is_created());
        resource.destroy_from_hardware().unwrap();
    }

    #[test]
    fn failed_create_leaves_resource_uncreated() {
        let mut resource = FakeResource::new();
        resource.fail_next_create = true;
        assert!(resource.create_on_hardware().is_err());
        assert!(!resource.is_created());
        assert!(resource.lifecycle().ensure_created().is_err());
    }
}
