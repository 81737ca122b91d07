use core::{
    ffi::c_void,
    fmt,
    marker::PhantomData,
    mem,
    ptr::null_mut,
};

/// A raw OS handle or OS-allocated pointer, as returned by Win32.
pub type RawHandle = *mut c_void;

/// The release primitive for one kind of OS resource.
///
/// Implementors are zero-sized markers; [`Owned`] calls [`Release::release`]
/// exactly once for every valid value it wraps.
pub trait Release {
    /// Short name used in trace output.
    const KIND: &'static str;

    /// Releases `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid, owned value of this kind that is not used again
    /// after the call.
    unsafe fn release(raw: RawHandle) -> bool;
}

/// Exclusive owner of an OS resource, released on drop.
///
/// A value of zero or `-1` is treated as invalid and never released. After an
/// explicit [`Owned::close`] the wrapper holds zero, so the drop that follows
/// is a no-op.
pub struct Owned<R: Release> {
    raw: RawHandle,
    kind: PhantomData<R>,
}

// Handles and OS buffers are not tied to the creating thread.
unsafe impl<R: Release> Send for Owned<R> {}

impl<R: Release> Owned<R> {
    /// Takes ownership of `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be either invalid (zero / `-1`) or a value of kind `R` that
    /// nothing else will release.
    pub unsafe fn from_raw(raw: RawHandle) -> Self {
        Self { raw, kind: PhantomData }
    }

    /// An empty wrapper, useful as a placeholder for optional handles.
    pub fn null() -> Self {
        Self { raw: null_mut(), kind: PhantomData }
    }

    /// Returns `true` for zero or `-1`.
    pub fn is_invalid(&self) -> bool {
        is_invalid(self.raw)
    }

    /// Returns the raw value without giving up ownership.
    ///
    /// The value is only meaningful while `self` is alive.
    pub fn as_raw(&self) -> RawHandle {
        self.raw
    }

    /// Pins the resource for the duration of a raw read.
    ///
    /// The returned guard borrows `self`, so the resource cannot be closed or
    /// dropped until the guard goes out of scope, on every control path.
    pub fn pin(&self) -> Pinned<'_, R> {
        Pinned { raw: self.raw, owner: PhantomData }
    }

    /// Releases ownership without running the release primitive.
    pub fn into_raw(self) -> RawHandle {
        let raw = self.raw;
        mem::forget(self);
        raw
    }

    /// Releases the resource now.
    ///
    /// Returns the result of the release primitive, or `true` if there was
    /// nothing to release. Calling it again is a no-op.
    pub fn close(&mut self) -> bool {
        let raw = mem::replace(&mut self.raw, null_mut());
        if is_invalid(raw) {
            return true;
        }

        let released = unsafe { R::release(raw) };
        if !released {
            tracing::warn!(kind = R::KIND, handle = ?raw, "release primitive reported failure");
        }

        released
    }
}

impl<R: Release> Drop for Owned<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: Release> fmt::Debug for Owned<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(R::KIND).field(&self.raw).finish()
    }
}

/// A borrow of an [`Owned`] resource that keeps it alive.
pub struct Pinned<'a, R: Release> {
    raw: RawHandle,
    owner: PhantomData<&'a Owned<R>>,
}

impl<R: Release> Pinned<'_, R> {
    /// The pinned value reinterpreted as a pointer to `T`.
    pub fn as_ptr<T>(&self) -> *const T {
        self.raw as *const T
    }

    /// The pinned raw value.
    pub fn as_raw(&self) -> RawHandle {
        self.raw
    }
}

fn is_invalid(raw: RawHandle) -> bool {
    raw.is_null() || raw as isize == -1
}

#[cfg(windows)]
pub use self::kinds::*;

#[cfg(windows)]
mod kinds {
    use super::{Owned, RawHandle, Release};
    use windows_sys::Win32::{
        Foundation::{CloseHandle, LocalFree, FALSE},
        System::{
            Environment::DestroyEnvironmentBlock,
            Memory::{LocalAlloc, LPTR},
            RemoteDesktop::WTSFreeMemory,
        },
    };

    /// Kernel objects closed with `CloseHandle`: tokens, pipe ends, processes, threads.
    pub struct Kernel;

    impl Release for Kernel {
        const KIND: &'static str = "KernelHandle";

        unsafe fn release(raw: RawHandle) -> bool {
            CloseHandle(raw) != FALSE
        }
    }

    /// Environment blocks from `CreateEnvironmentBlock`.
    pub struct Environment;

    impl Release for Environment {
        const KIND: &'static str = "EnvironmentBlock";

        unsafe fn release(raw: RawHandle) -> bool {
            DestroyEnvironmentBlock(raw) != FALSE
        }
    }

    /// Buffers handed out by the WTS API.
    pub struct WtsMemory;

    impl Release for WtsMemory {
        const KIND: &'static str = "WtsBuffer";

        unsafe fn release(raw: RawHandle) -> bool {
            WTSFreeMemory(raw);
            true
        }
    }

    /// Heap buffers from `LocalAlloc`.
    pub struct LocalMemory;

    impl Release for LocalMemory {
        const KIND: &'static str = "LocalBuffer";

        unsafe fn release(raw: RawHandle) -> bool {
            LocalFree(raw).is_null()
        }
    }

    pub type KernelHandle = Owned<Kernel>;
    pub type WtsBuffer = Owned<WtsMemory>;
    pub type LocalBuffer = Owned<LocalMemory>;

    impl LocalBuffer {
        /// Allocates `len` zeroed bytes, returning the Win32 error on failure.
        pub fn alloc(len: usize) -> Result<Self, u32> {
            let raw = unsafe { LocalAlloc(LPTR, len) };
            if raw.is_null() {
                return Err(crate::error::last_error());
            }

            Ok(unsafe { Owned::from_raw(raw) })
        }
    }
}
