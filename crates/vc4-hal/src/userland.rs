//! Run-time loading of the VideoCore userland libraries.
//!
//! `libbcm_host.so` and `libvcsm.so` are only present on Raspberry Pi OS images, so they are
//! opened with `dlopen` instead of being linked. Every function the backends need is resolved
//! once, when the library is loaded; a missing symbol fails the load.

use std::ffi::{c_char, c_int, c_uint, c_void};

use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
use libloading::Library;

use crate::error::{HalError, HalResult};
use crate::vchi::ffi::GpuJob;
use crate::vcsm::ffi::CleanInvalidRequest;

const LOOKUP_PATHS: [&str; 2] = ["/opt/vc/lib/", "/usr/lib/arm-linux-gnueabihf/"];

pub const BCM_HOST_LIBRARY: &str = "libbcm_host.so";
pub const VCSM_LIBRARY: &str = "libvcsm.so";

fn open_library(name: &'static str) -> HalResult<Library> {
    let mut last_error = None;
    for dir in LOOKUP_PATHS {
        let path = format!("{dir}{name}");
        // SAFETY: the VideoCore userland libraries have no initialisers with preconditions.
        match unsafe { UnixLibrary::open(Some(&path), RTLD_NOW | RTLD_GLOBAL) } {
            Ok(lib) => {
                tracing::debug!(%path, "loaded userland library");
                return Ok(lib.into());
            }
            Err(err) => last_error = Some(err),
        }
    }
    // Fall back to the default search path.
    // SAFETY: as above.
    match unsafe { UnixLibrary::open(Some(name), RTLD_NOW | RTLD_GLOBAL) } {
        Ok(lib) => Ok(lib.into()),
        Err(err) => Err(HalError::Library {
            library: name,
            source: last_error.unwrap_or(err),
        }),
    }
}

/// Copies the function pointer `name` out of `lib`.
///
/// # Safety
/// `T` must be the exact C signature of the symbol.
unsafe fn resolve<T: Copy>(lib: &Library, library: &'static str, name: &[u8]) -> HalResult<T> {
    lib.get::<T>(name)
        .map(|symbol| *symbol)
        .map_err(|source| HalError::Library { library, source })
}

pub type VchiInstance = *mut c_void;
pub type VchiConnection = c_void;

/// `libbcm_host.so`: SoC information.
pub struct BcmHost {
    _lib: Library,
    get_peripheral_address: unsafe extern "C" fn() -> c_uint,
}

impl BcmHost {
    pub fn load() -> HalResult<Self> {
        let lib = open_library(BCM_HOST_LIBRARY)?;
        // SAFETY: signature from bcm_host.h.
        let get_peripheral_address =
            unsafe { resolve(&lib, BCM_HOST_LIBRARY, b"bcm_host_get_peripheral_address\0")? };
        Ok(Self {
            _lib: lib,
            get_peripheral_address,
        })
    }

    /// ARM physical address of the peripheral block.
    pub fn peripheral_address(&self) -> u32 {
        // SAFETY: no preconditions.
        unsafe { (self.get_peripheral_address)() }
    }
}

/// `libbcm_host.so`: VCHI connection, GPU service and general command service.
pub struct VchiApi {
    _lib: Library,
    pub(crate) vchi_initialise: unsafe extern "C" fn(*mut VchiInstance) -> c_int,
    pub(crate) vchi_connect:
        unsafe extern "C" fn(*mut *mut VchiConnection, c_uint, VchiInstance) -> c_int,
    pub(crate) vchi_disconnect: unsafe extern "C" fn(VchiInstance) -> c_int,
    pub(crate) vc_vchi_gencmd_init:
        unsafe extern "C" fn(VchiInstance, *mut *mut VchiConnection, c_uint),
    pub(crate) vc_gencmd: unsafe extern "C" fn(*mut c_char, c_int, *const c_char, ...) -> c_int,
    pub(crate) vc_gencmd_stop: unsafe extern "C" fn(),
    pub(crate) vc_gpuserv_init: unsafe extern "C" fn() -> c_int,
    pub(crate) vc_gpuserv_deinit: unsafe extern "C" fn(),
    pub(crate) vc_gpuserv_execute_code: unsafe extern "C" fn(c_int, *mut GpuJob) -> c_int,
}

impl VchiApi {
    pub fn load() -> HalResult<Self> {
        let lib = open_library(BCM_HOST_LIBRARY)?;
        let l = BCM_HOST_LIBRARY;
        // SAFETY: signatures from interface/vchi/vchi.h, vc_gencmd.h and vc_vchi_gpuserv.h.
        unsafe {
            Ok(Self {
                vchi_initialise: resolve(&lib, l, b"vchi_initialise\0")?,
                vchi_connect: resolve(&lib, l, b"vchi_connect\0")?,
                vchi_disconnect: resolve(&lib, l, b"vchi_disconnect\0")?,
                vc_vchi_gencmd_init: resolve(&lib, l, b"vc_vchi_gencmd_init\0")?,
                vc_gencmd: resolve(&lib, l, b"vc_gencmd\0")?,
                vc_gencmd_stop: resolve(&lib, l, b"vc_gencmd_stop\0")?,
                vc_gpuserv_init: resolve(&lib, l, b"vc_gpuserv_init\0")?,
                vc_gpuserv_deinit: resolve(&lib, l, b"vc_gpuserv_deinit\0")?,
                vc_gpuserv_execute_code: resolve(&lib, l, b"vc_gpuserv_execute_code\0")?,
                _lib: lib,
            })
        }
    }
}

/// `libvcsm.so`: VideoCore shared memory.
pub struct VcsmApi {
    _lib: Library,
    pub(crate) vcsm_init_ex: unsafe extern "C" fn(c_int, c_int) -> c_int,
    pub(crate) vcsm_exit: unsafe extern "C" fn(),
    pub(crate) vcsm_malloc_cache: unsafe extern "C" fn(c_uint, c_int, *const c_char) -> c_uint,
    pub(crate) vcsm_free: unsafe extern "C" fn(c_uint),
    pub(crate) vcsm_vc_addr_from_hdl: unsafe extern "C" fn(c_uint) -> c_uint,
    pub(crate) vcsm_lock: unsafe extern "C" fn(c_uint) -> *mut c_void,
    pub(crate) vcsm_unlock_ptr_sp: unsafe extern "C" fn(*mut c_void, c_int) -> c_int,
    pub(crate) vcsm_clean_invalid2: unsafe extern "C" fn(*mut CleanInvalidRequest) -> c_int,
}

impl VcsmApi {
    pub fn load() -> HalResult<Self> {
        let lib = open_library(VCSM_LIBRARY)?;
        let l = VCSM_LIBRARY;
        // SAFETY: signatures from user-vcsm.h.
        unsafe {
            Ok(Self {
                vcsm_init_ex: resolve(&lib, l, b"vcsm_init_ex\0")?,
                vcsm_exit: resolve(&lib, l, b"vcsm_exit\0")?,
                vcsm_malloc_cache: resolve(&lib, l, b"vcsm_malloc_cache\0")?,
                vcsm_free: resolve(&lib, l, b"vcsm_free\0")?,
                vcsm_vc_addr_from_hdl: resolve(&lib, l, b"vcsm_vc_addr_from_hdl\0")?,
                vcsm_lock: resolve(&lib, l, b"vcsm_lock\0")?,
                vcsm_unlock_ptr_sp: resolve(&lib, l, b"vcsm_unlock_ptr_sp\0")?,
                vcsm_clean_invalid2: resolve(&lib, l, b"vcsm_clean_invalid2\0")?,
                _lib: lib,
            })
        }
    }
}
