//! Backend that forwards operations to a dynamically loaded translation
//! library exposing the `fp_render_*` C ABI.
//!
//! Required symbols:
//!
//! | symbol                   | signature                                              |
//! |--------------------------|--------------------------------------------------------|
//! | `fp_render_abi_version`  | `() -> u32`                                            |
//! | `fp_render_init`         | `(width, height, format, *mut *mut ctx) -> int`        |
//! | `fp_render_submit`       | `(ctx, opcode: u16, data, len) -> int`                 |
//! | `fp_render_read_pixels`  | `(ctx, dst, len, stride) -> int`                       |
//! | `fp_render_destroy`      | `(ctx)`                                                |
//!
//! Optional: `fp_render_resize(ctx, w, h)`, `fp_render_set_rotation(ctx, deg)`,
//! `fp_render_vendor()` and `fp_render_version()` (static C strings).
//!
//! `fp_render_submit` returns 0 when applied, 1 when the opcode is not
//! supported and a negative value when the context is lost.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use bytes::BytesMut;
use framepipe_channel::{FrameView, Geometry};
use tracing::{debug, info, warn};

use super::{BackendIdentity, OpStatus, Readiness};
use crate::command::Command;
use crate::config::{BackendKind, NativeConfig, Rotation, NATIVE_LIBRARY_NAME};
use crate::error::BackendError;

/// ABI revision this backend speaks.
pub const ABI_VERSION: u32 = 1;

const SUBMIT_APPLIED: c_int = 0;
const SUBMIT_UNSUPPORTED: c_int = 1;

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type InitFn = unsafe extern "C" fn(u32, u32, u32, *mut *mut c_void) -> c_int;
type SubmitFn = unsafe extern "C" fn(*mut c_void, u16, *const u8, usize) -> c_int;
type ReadPixelsFn = unsafe extern "C" fn(*mut c_void, *mut u8, usize, u32) -> c_int;
type DestroyFn = unsafe extern "C" fn(*mut c_void);
type ResizeFn = unsafe extern "C" fn(*mut c_void, u32, u32) -> c_int;
type SetRotationFn = unsafe extern "C" fn(*mut c_void, u32) -> c_int;
type InfoFn = unsafe extern "C" fn() -> *const c_char;

/// A `dlopen` handle, closed on drop.
struct Library {
    handle: NonNull<c_void>,
    path: PathBuf,
}

impl Library {
    fn open(path: &Path) -> Result<Self, String> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "path contains a NUL byte".to_string())?;
        // SAFETY: `c_path` is a valid NUL-terminated string.
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        match NonNull::new(handle) {
            Some(handle) => Ok(Self {
                handle,
                path: path.to_path_buf(),
            }),
            None => Err(last_dl_error()),
        }
    }

    /// Look up `name` as a function pointer of type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be the `extern "C"` fn type the library exports under `name`.
    unsafe fn symbol<F: Copy>(&self, name: &CStr) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        // SAFETY: the handle is open for the lifetime of `self`.
        let ptr = unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) };
        if ptr.is_null() {
            None
        } else {
            // SAFETY: caller guarantees `F` matches the exported symbol.
            Some(unsafe { std::mem::transmute_copy::<*mut c_void, F>(&ptr) })
        }
    }

    /// Look up a symbol the backend cannot run without.
    ///
    /// # Safety
    ///
    /// Same contract as [`Library::symbol`].
    unsafe fn require<F: Copy>(&self, name: &CStr) -> Result<F, BackendError> {
        // SAFETY: forwarded to the caller.
        unsafe { self.symbol(name) }.ok_or_else(|| {
            BackendError::MissingDriver(format!(
                "{} lacks {}",
                self.path.display(),
                name.to_string_lossy()
            ))
        })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: the handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a thread-local NUL-terminated string.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dlopen failure".to_string()
    } else {
        // SAFETY: non-null dlerror results are valid C strings.
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Resolved entry points. Only valid while the owning [`Library`] is open.
#[derive(Clone, Copy)]
struct Api {
    init: InitFn,
    submit: SubmitFn,
    read_pixels: ReadPixelsFn,
    destroy: DestroyFn,
    resize: Option<ResizeFn>,
    set_rotation: Option<SetRotationFn>,
}

/// Live library state: the handle, its entry points and one context.
struct Loaded {
    api: Api,
    context: NonNull<c_void>,
    // Dropped last so the entry points stay valid until the context is gone.
    library: Library,
}

impl Loaded {
    fn destroy(self) {
        // SAFETY: `context` came from `init` and is destroyed exactly once.
        unsafe { (self.api.destroy)(self.context.as_ptr()) };
        debug!(library = %self.library.path.display(), "native context destroyed");
    }
}

/// Native graphics backend.
pub struct NativeBackend {
    config: NativeConfig,
    loaded: Option<Loaded>,
    geometry: Option<Geometry>,
    rotation: Rotation,
    buffer: Vec<u8>,
    scratch: BytesMut,
    vendor: Option<String>,
    version: Option<String>,
    lost: bool,
}

// SAFETY: the context pointer is only touched through `&mut self`, so it is
// never used from two threads at once. Libraries implementing the ABI must
// tolerate being driven from whichever thread owns the backend.
unsafe impl Send for NativeBackend {}

impl NativeBackend {
    pub fn new(config: NativeConfig) -> Self {
        Self {
            config,
            loaded: None,
            geometry: None,
            rotation: Rotation::Deg0,
            buffer: Vec::new(),
            scratch: BytesMut::new(),
            vendor: None,
            version: None,
            lost: false,
        }
    }

    pub fn initialize(&mut self, geometry: Geometry, rotation: Rotation) -> Result<(), BackendError> {
        self.shutdown();

        let library = self.load_library()?;
        // SAFETY: the fn types mirror the documented fp_render_* ABI.
        let (abi_version, api, vendor, version) = unsafe {
            let abi_version: AbiVersionFn = library.require(c"fp_render_abi_version")?;
            let api = Api {
                init: library.require(c"fp_render_init")?,
                submit: library.require(c"fp_render_submit")?,
                read_pixels: library.require(c"fp_render_read_pixels")?,
                destroy: library.require(c"fp_render_destroy")?,
                resize: library.symbol(c"fp_render_resize"),
                set_rotation: library.symbol(c"fp_render_set_rotation"),
            };
            let vendor: Option<InfoFn> = library.symbol(c"fp_render_vendor");
            let version: Option<InfoFn> = library.symbol(c"fp_render_version");
            (abi_version, api, vendor, version)
        };

        // SAFETY: resolved above with the matching signature.
        let found = unsafe { abi_version() };
        if found != ABI_VERSION {
            return Err(BackendError::IncompatibleVersion {
                found,
                expected: ABI_VERSION,
            });
        }

        let context = create_context(&api, &geometry)?;
        let loaded = Loaded {
            api,
            context,
            library,
        };

        if rotation != Rotation::Deg0 {
            if let Err(err) = apply_rotation(&loaded, rotation) {
                loaded.destroy();
                return Err(err);
            }
        }

        self.vendor = vendor.and_then(info_string);
        self.version = version.and_then(info_string);
        info!(
            library = %loaded.library.path.display(),
            vendor = self.vendor.as_deref().unwrap_or("unknown"),
            width = geometry.width(),
            height = geometry.height(),
            "native backend initialized"
        );

        self.loaded = Some(loaded);
        self.geometry = Some(geometry);
        self.rotation = rotation;
        self.lost = false;
        Ok(())
    }

    /// Explicit path first (any soname `dlopen` resolves), then each search
    /// directory that actually contains the library.
    fn load_library(&self) -> Result<Library, BackendError> {
        let mut tried = Vec::new();

        if let Some(path) = &self.config.library_path {
            match Library::open(path) {
                Ok(library) => return Ok(library),
                Err(err) => tried.push(err),
            }
        }
        for dir in &self.config.search_paths {
            let path = dir.join(NATIVE_LIBRARY_NAME);
            if !path.is_file() {
                continue;
            }
            match Library::open(&path) {
                Ok(library) => return Ok(library),
                Err(err) => tried.push(err),
            }
        }

        Err(BackendError::MissingDriver(if tried.is_empty() {
            format!("{NATIVE_LIBRARY_NAME} not found in search path")
        } else {
            tried.join("; ")
        }))
    }

    fn loaded(&self) -> Result<&Loaded, BackendError> {
        if self.lost {
            return Err(BackendError::ContextLost {
                call: "previous call",
                code: -1,
            });
        }
        self.loaded.as_ref().ok_or(BackendError::NotInitialized)
    }

    pub fn process(&mut self, command: &Command) -> Result<OpStatus, BackendError> {
        let loaded = self.loaded()?;
        let (submit, context) = (loaded.api.submit, loaded.context);

        self.scratch.clear();
        command.encode_payload(&mut self.scratch);
        let opcode = command.opcode() as u16;

        // SAFETY: `context` is live and `scratch` is readable for its length.
        let rc = unsafe {
            submit(
                context.as_ptr(),
                opcode,
                self.scratch.as_ptr(),
                self.scratch.len(),
            )
        };
        match rc {
            SUBMIT_APPLIED => Ok(OpStatus::Applied),
            SUBMIT_UNSUPPORTED => Ok(OpStatus::Unsupported),
            rc if rc < 0 => {
                self.lost = true;
                Err(BackendError::ContextLost {
                    call: "fp_render_submit",
                    code: rc,
                })
            }
            rc => {
                debug!(opcode, rc, "unexpected submit status treated as unsupported");
                Ok(OpStatus::Unsupported)
            }
        }
    }

    pub fn produce_frame(
        &mut self,
        frame_number: u64,
        timestamp_ns: u64,
    ) -> Result<FrameView<'_>, BackendError> {
        let loaded = self.loaded()?;
        let (read_pixels, context) = (loaded.api.read_pixels, loaded.context);
        let geometry = self.geometry.ok_or(BackendError::NotInitialized)?;

        self.buffer.resize(geometry.frame_len(), 0);
        // SAFETY: `buffer` is writable for `frame_len` bytes.
        let rc = unsafe {
            read_pixels(
                context.as_ptr(),
                self.buffer.as_mut_ptr(),
                self.buffer.len(),
                geometry.stride(),
            )
        };
        if rc != 0 {
            self.lost = true;
            return Err(BackendError::ContextLost {
                call: "fp_render_read_pixels",
                code: rc,
            });
        }

        Ok(FrameView {
            geometry,
            frame_number,
            timestamp_ns,
            pixels: &self.buffer,
        })
    }

    pub fn readiness(&self) -> Readiness {
        if self.lost {
            Readiness::Lost
        } else if self.loaded.is_some() {
            Readiness::Ready
        } else {
            Readiness::Uninitialized
        }
    }

    /// Resize in place when the library supports it, otherwise rebuild the
    /// context at the new size.
    pub fn resize(&mut self, geometry: Geometry) -> Result<(), BackendError> {
        let loaded = self.loaded()?;

        if let Some(resize) = loaded.api.resize {
            // SAFETY: `context` is live.
            let rc = unsafe { resize(loaded.context.as_ptr(), geometry.width(), geometry.height()) };
            if rc != 0 {
                self.lost = true;
                return Err(BackendError::ContextLost {
                    call: "fp_render_resize",
                    code: rc,
                });
            }
            self.geometry = Some(geometry);
            return Ok(());
        }

        debug!("library has no fp_render_resize; recreating context");
        let Some(mut loaded) = self.loaded.take() else {
            return Err(BackendError::NotInitialized);
        };
        // SAFETY: the old context is destroyed exactly once before replacement.
        unsafe { (loaded.api.destroy)(loaded.context.as_ptr()) };
        match create_context(&loaded.api, &geometry) {
            Ok(context) => loaded.context = context,
            Err(err) => {
                self.lost = true;
                self.geometry = None;
                return Err(err);
            }
        }
        if self.rotation != Rotation::Deg0 {
            if let Err(err) = apply_rotation(&loaded, self.rotation) {
                self.lost = true;
                self.loaded = Some(loaded);
                return Err(err);
            }
        }
        self.loaded = Some(loaded);
        self.geometry = Some(geometry);
        Ok(())
    }

    pub fn set_rotation(&mut self, rotation: Rotation) -> Result<(), BackendError> {
        let loaded = self.loaded()?;
        if loaded.api.set_rotation.is_none() {
            warn!(
                degrees = rotation.degrees(),
                "library has no fp_render_set_rotation; frames stay unrotated"
            );
        } else if let Err(err) = apply_rotation(loaded, rotation) {
            self.lost = true;
            return Err(err);
        }
        self.rotation = rotation;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            loaded.destroy();
        }
        self.geometry = None;
        self.buffer = Vec::new();
        self.lost = false;
    }

    pub fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            kind: BackendKind::Native,
            vendor: self.vendor.clone().unwrap_or_else(|| "unknown".to_string()),
            version: self
                .version
                .clone()
                .unwrap_or_else(|| format!("abi {ABI_VERSION}")),
        }
    }

    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn create_context(api: &Api, geometry: &Geometry) -> Result<NonNull<c_void>, BackendError> {
    let mut context = ptr::null_mut();
    // SAFETY: `context` is a valid out-pointer.
    let rc = unsafe {
        (api.init)(
            geometry.width(),
            geometry.height(),
            geometry.format().code(),
            &mut context,
        )
    };
    if rc == -libc::ENOMEM {
        return Err(BackendError::ResourceExhausted(
            "fp_render_init: out of memory".to_string(),
        ));
    }
    if rc != 0 {
        return Err(BackendError::ContextLost {
            call: "fp_render_init",
            code: rc,
        });
    }
    NonNull::new(context).ok_or(BackendError::ContextLost {
        call: "fp_render_init",
        code: 0,
    })
}

fn apply_rotation(loaded: &Loaded, rotation: Rotation) -> Result<(), BackendError> {
    let Some(set_rotation) = loaded.api.set_rotation else {
        return Ok(());
    };
    // SAFETY: `context` is live.
    let rc = unsafe { set_rotation(loaded.context.as_ptr(), rotation.degrees()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(BackendError::ContextLost {
            call: "fp_render_set_rotation",
            code: rc,
        })
    }
}

fn info_string(f: InfoFn) -> Option<String> {
    // SAFETY: the ABI documents a static NUL-terminated string or NULL.
    let ptr = unsafe { f() };
    if ptr.is_null() {
        None
    } else {
        // SAFETY: non-null results are valid C strings.
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framepipe_channel::PixelFormat;

    fn geometry() -> Geometry {
        Geometry::new(4, 4, PixelFormat::Bgra8888).unwrap()
    }

    fn config(library_path: Option<&str>) -> NativeConfig {
        NativeConfig {
            library_path: library_path.map(PathBuf::from),
            search_paths: vec![PathBuf::from("/nonexistent/framepipe")],
        }
    }

    #[test]
    fn missing_library_is_missing_driver() {
        let mut backend = NativeBackend::new(config(Some("/nonexistent/libfprender.so")));
        let err = backend.initialize(geometry(), Rotation::Deg0).unwrap_err();
        assert!(matches!(err, BackendError::MissingDriver(_)), "{err}");
        assert_eq!(backend.readiness(), Readiness::Uninitialized);
    }

    #[test]
    fn empty_search_path_is_missing_driver() {
        let mut backend = NativeBackend::new(config(None));
        let err = backend.initialize(geometry(), Rotation::Deg0).unwrap_err();
        match err {
            BackendError::MissingDriver(message) => assert!(message.contains(NATIVE_LIBRARY_NAME)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn library_without_entry_points_is_missing_driver() {
        let mut backend = NativeBackend::new(config(Some("libc.so.6")));
        match backend.initialize(geometry(), Rotation::Deg0).unwrap_err() {
            BackendError::MissingDriver(message) => {
                assert!(message.contains("fp_render_abi_version"), "{message}")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn work_before_initialize_is_rejected() {
        let mut backend = NativeBackend::new(NativeConfig::default());
        assert!(matches!(
            backend.process(&Command::Nop),
            Err(BackendError::NotInitialized)
        ));
        assert!(matches!(
            backend.resize(geometry()),
            Err(BackendError::NotInitialized)
        ));
        assert_eq!(backend.identity().version, format!("abi {ABI_VERSION}"));
    }
}
