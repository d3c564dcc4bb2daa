//! Typed bindings to the EPA shared library
//!
//! Opening the library resolves its entry points, runs `epa_init` and
//! installs the library's function object allocator and error slot as the
//! active ABI. Every binding that can fail or run callbacks lowers its
//! function arguments through a `CallScope`, lifts the returned object with
//! the scope's handles (plus the library itself) and checks the error
//! channel. Global setting accessors and constants do not check.

use crate::ffi::abi::{self, FunctionAbi, NativeErrorSlot};
use crate::ffi::error::{self, FfiError};
use crate::ffi::function::Function;
use crate::ffi::handles::KeepAlive;
use crate::ffi::loader::{symbol, LibraryLoader, LoadError};
use crate::ffi::marshal::CallScope;
use crate::ffi::types::{FunctionKind, RawFunction};
use crate::integration::{integrator_generator, IntegrationSettings};
use crate::value::Value;
use epa_config::{Config, IntegrationMethod};
use libloading::Library;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;

type Ptr = *mut RawFunction;
type XsectionFid = unsafe extern "C" fn(Ptr, Ptr, f64, f64, f64, f64, f64, f64, f64, Ptr) -> Ptr;

#[derive(Clone, Copy)]
struct Api {
    init: unsafe extern "C" fn(),
    version: unsafe extern "C" fn(*mut c_int, *mut c_int, *mut c_int),

    get_error: unsafe extern "C" fn() -> *mut c_void,
    get_error_layer: unsafe extern "C" fn() -> c_int,
    set_error: unsafe extern "C" fn(*mut c_void, c_int),
    clear_error: unsafe extern "C" fn(),
    error_message: unsafe extern "C" fn(*mut c_void) -> *const c_char,
    make_function: abi::MakeFunction,
    destroy_function: abi::DestroyFunction,

    alpha: unsafe extern "C" fn() -> f64,
    planck: unsafe extern "C" fn() -> f64,
    barn: unsafe extern "C" fn() -> f64,
    fm: unsafe extern "C" fn() -> f64,
    amu: unsafe extern "C" fn() -> f64,
    infinity: unsafe extern "C" fn() -> f64,

    get_print_backtrace: unsafe extern "C" fn() -> c_int,
    set_print_backtrace: unsafe extern "C" fn(c_int),
    get_default_integration_method: unsafe extern "C" fn() -> c_int,
    set_default_integration_method: unsafe extern "C" fn(c_int),
    get_default_absolute_error: unsafe extern "C" fn() -> f64,
    set_default_absolute_error: unsafe extern "C" fn(f64),
    get_default_relative_error: unsafe extern "C" fn() -> f64,
    set_default_relative_error: unsafe extern "C" fn(f64),
    get_default_error_step: unsafe extern "C" fn() -> f64,
    set_default_error_step: unsafe extern "C" fn(f64),
    get_default_integration_limit: unsafe extern "C" fn() -> usize,
    set_default_integration_limit: unsafe extern "C" fn(usize),
    get_default_cquad_integration_limit: unsafe extern "C" fn() -> usize,
    set_default_cquad_integration_limit: unsafe extern "C" fn(usize),

    make_qag_workspace: unsafe extern "C" fn(usize) -> *mut c_void,
    destroy_qag_workspace: unsafe extern "C" fn(*mut c_void),
    qag_integrator: unsafe extern "C" fn(f64, f64, c_int, *mut c_void) -> Ptr,
    make_cquad_workspace: unsafe extern "C" fn(usize) -> *mut c_void,
    destroy_cquad_workspace: unsafe extern "C" fn(*mut c_void),
    cquad_integrator: unsafe extern "C" fn(f64, f64, *mut c_void) -> Ptr,

    form_factor_monopole: unsafe extern "C" fn(f64) -> Ptr,
    form_factor_dipole: unsafe extern "C" fn(f64) -> Ptr,
    spectrum: unsafe extern "C" fn(c_uint, f64, Ptr, Ptr) -> Ptr,
    spectrum_monopole: unsafe extern "C" fn(c_uint, f64, f64) -> Ptr,
    spectrum_dipole: unsafe extern "C" fn(c_uint, f64, f64) -> Ptr,
    spectrum_b: unsafe extern "C" fn(c_uint, f64, Ptr, Ptr) -> Ptr,
    spectrum_b_point: unsafe extern "C" fn(c_uint, f64) -> Ptr,
    spectrum_b_monopole: unsafe extern "C" fn(c_uint, f64, f64) -> Ptr,
    spectrum_b_dipole: unsafe extern "C" fn(c_uint, f64, f64) -> Ptr,
    luminosity: unsafe extern "C" fn(Ptr, Ptr, Ptr) -> Ptr,
    luminosity_y: unsafe extern "C" fn(Ptr, Ptr) -> Ptr,
    luminosity_fid: unsafe extern "C" fn(Ptr, Ptr, Ptr) -> Ptr,
    luminosity_b: unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, c_uint) -> Ptr,
    luminosity_y_b: unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, c_uint) -> Ptr,
    luminosity_fid_b: unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, c_uint) -> Ptr,
    xsection: unsafe extern "C" fn(Ptr, Ptr) -> Ptr,
    xsection_b: unsafe extern "C" fn(Ptr, Ptr) -> Ptr,
    xsection_fid: XsectionFid,
    xsection_fid_b: XsectionFid,
    photons_to_fermions: unsafe extern "C" fn(f64, f64) -> Ptr,
    photons_to_fermions_pt: unsafe extern "C" fn(f64, f64) -> Ptr,
    photons_to_fermions_b: unsafe extern "C" fn(f64, f64) -> Ptr,
    photons_to_fermions_pt_b: unsafe extern "C" fn(f64, f64) -> Ptr,
}

impl Api {
    /// # Safety
    ///
    /// `library` must be the EPA library; the result is only valid while it stays loaded.
    unsafe fn resolve(library: &Library, name: &str) -> Result<Self, LoadError> {
        macro_rules! sym {
            ($symbol:literal) => {
                symbol(library, name, $symbol)?
            };
        }

        Ok(Self {
            init: sym!("epa_init"),
            version: sym!("epa_version"),
            get_error: sym!("epa_get_error"),
            get_error_layer: sym!("epa_get_error_layer"),
            set_error: sym!("epa_set_error"),
            clear_error: sym!("epa_clear_error"),
            error_message: sym!("epa_cpp_error_message"),
            make_function: sym!("epa_make_function"),
            destroy_function: sym!("epa_destroy_function"),
            alpha: sym!("epa_alpha"),
            planck: sym!("epa_planck"),
            barn: sym!("epa_barn"),
            fm: sym!("epa_fm"),
            amu: sym!("epa_amu"),
            infinity: sym!("epa_infinity"),
            get_print_backtrace: sym!("epa_get_print_backtrace"),
            set_print_backtrace: sym!("epa_set_print_backtrace"),
            get_default_integration_method: sym!("epa_get_default_integration_method"),
            set_default_integration_method: sym!("epa_set_default_integration_method"),
            get_default_absolute_error: sym!("epa_get_default_absolute_error"),
            set_default_absolute_error: sym!("epa_set_default_absolute_error"),
            get_default_relative_error: sym!("epa_get_default_relative_error"),
            set_default_relative_error: sym!("epa_set_default_relative_error"),
            get_default_error_step: sym!("epa_get_default_error_step"),
            set_default_error_step: sym!("epa_set_default_error_step"),
            get_default_integration_limit: sym!("epa_get_default_integration_limit"),
            set_default_integration_limit: sym!("epa_set_default_integration_limit"),
            get_default_cquad_integration_limit: sym!("epa_get_default_cquad_integration_limit"),
            set_default_cquad_integration_limit: sym!("epa_set_default_cquad_integration_limit"),
            make_qag_workspace: sym!("epa_make_qag_integration_workspace"),
            destroy_qag_workspace: sym!("epa_destroy_qag_integration_workspace"),
            qag_integrator: sym!("epa_qag_integrator"),
            make_cquad_workspace: sym!("epa_make_cquad_integration_workspace"),
            destroy_cquad_workspace: sym!("epa_destroy_cquad_integration_workspace"),
            cquad_integrator: sym!("epa_cquad_integrator"),
            form_factor_monopole: sym!("epa_form_factor_monopole"),
            form_factor_dipole: sym!("epa_form_factor_dipole"),
            spectrum: sym!("epa_spectrum"),
            spectrum_monopole: sym!("epa_spectrum_monopole"),
            spectrum_dipole: sym!("epa_spectrum_dipole"),
            spectrum_b: sym!("epa_spectrum_b"),
            spectrum_b_point: sym!("epa_spectrum_b_point"),
            spectrum_b_monopole: sym!("epa_spectrum_b_monopole"),
            spectrum_b_dipole: sym!("epa_spectrum_b_dipole"),
            luminosity: sym!("epa_luminosity"),
            luminosity_y: sym!("epa_luminosity_y"),
            luminosity_fid: sym!("epa_luminosity_fid"),
            luminosity_b: sym!("epa_luminosity_b"),
            luminosity_y_b: sym!("epa_luminosity_y_b"),
            luminosity_fid_b: sym!("epa_luminosity_fid_b"),
            xsection: sym!("epa_xsection"),
            xsection_b: sym!("epa_xsection_b"),
            xsection_fid: sym!("epa_xsection_fid"),
            xsection_fid_b: sym!("epa_xsection_fid_b"),
            photons_to_fermions: sym!("epa_photons_to_fermions"),
            photons_to_fermions_pt: sym!("epa_photons_to_fermions_pT"),
            photons_to_fermions_b: sym!("epa_photons_to_fermions_b"),
            photons_to_fermions_pt_b: sym!("epa_photons_to_fermions_pT_b"),
        })
    }

    fn function_abi(&self) -> FunctionAbi {
        FunctionAbi {
            make_function: self.make_function,
            destroy_function: self.destroy_function,
            error_slot: Some(NativeErrorSlot {
                get_error: self.get_error,
                get_layer: self.get_error_layer,
                set_error: self.set_error,
                clear_error: self.clear_error,
                message: self.error_message,
            }),
        }
    }
}

/// Physical constants exported by the library (natural units, GeV)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constants {
    pub alpha: f64,
    pub planck: f64,
    pub barn: f64,
    pub fm: f64,
    pub amu: f64,
    pub infinity: f64,
}

/// Integration workspace allocated by the library
pub struct Workspace {
    raw: NonNull<c_void>,
    destroy: unsafe extern "C" fn(*mut c_void),
    limit: usize,
    _library: Arc<Library>,
}

// Safety: the workspace is only touched by native code; concurrent use of
// one workspace is the library's contract
unsafe impl Send for Workspace {}
unsafe impl Sync for Workspace {}

impl Workspace {
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // SAFETY: allocated by the matching make function, released once
        unsafe { (self.destroy)(self.raw.as_ptr()) };
    }
}

/// QAG (adaptive Gauss-Kronrod) workspace
#[derive(Clone)]
pub struct QagWorkspace(Arc<Workspace>);

/// CQUAD (doubly adaptive) workspace
#[derive(Clone)]
pub struct CquadWorkspace(Arc<Workspace>);

impl QagWorkspace {
    pub fn limit(&self) -> usize {
        self.0.limit()
    }
}

impl CquadWorkspace {
    pub fn limit(&self) -> usize {
        self.0.limit()
    }
}

/// QAG integrator parameters; `None` uses the library default
///
/// Without a workspace the library allocates one per integration.
#[derive(Clone, Default)]
pub struct QagOptions {
    pub absolute_error: Option<f64>,
    pub relative_error: Option<f64>,
    pub method: Option<IntegrationMethod>,
    pub workspace: Option<QagWorkspace>,
}

/// CQUAD integrator parameters; `None` uses the library default
#[derive(Clone, Default)]
pub struct CquadOptions {
    pub absolute_error: Option<f64>,
    pub relative_error: Option<f64>,
    pub workspace: Option<CquadWorkspace>,
}

/// Fiducial cuts of a lepton pair cross section
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiducialCuts {
    pub mass: f64,
    pub pt_min: f64,
    pub eta_max: f64,
    pub w1_min: f64,
    pub w1_max: f64,
    pub w2_min: f64,
    pub w2_max: f64,
}

impl Default for FiducialCuts {
    fn default() -> Self {
        Self {
            mass: 0.0,
            pt_min: 0.0,
            eta_max: f64::INFINITY,
            w1_min: 0.0,
            w1_max: f64::INFINITY,
            w2_min: 0.0,
            w2_max: f64::INFINITY,
        }
    }
}

/// Loaded EPA library
#[derive(Clone)]
pub struct EpaLibrary {
    library: Arc<Library>,
    api: Api,
    name: String,
}

impl EpaLibrary {
    /// Open the library by name ("epa") or path
    pub fn open(name: &str) -> Result<Self, FfiError> {
        Self::open_with_loader(&LibraryLoader::new(), name)
    }

    /// Open the library configured in `config`
    pub fn open_with(config: &Config) -> Result<Self, FfiError> {
        let loader = LibraryLoader::with_search_paths(config.library_search_paths());
        let library = Self::open_with_loader(&loader, config.library_path())?;
        library.apply_default_settings(&IntegrationSettings::from(config));
        Ok(library)
    }

    pub fn open_with_loader(loader: &LibraryLoader, name: &str) -> Result<Self, FfiError> {
        let library = loader.load(name)?;
        // SAFETY: the symbols are copied out while `library` is held by self
        let api = unsafe { Api::resolve(&library, name)? };
        unsafe { (api.init)() };

        if !abi::install(api.function_abi()) {
            tracing::warn!(target: "epa::ffi::library", library = name, "function objects keep using the previously installed allocator");
        }

        let this = Self::from_parts(library, api, name);
        let (major, minor, patch) = this.version();
        tracing::debug!(target: "epa::ffi::library", library = name, major, minor, patch, "EPA library opened");
        Ok(this)
    }

    fn from_parts(library: Arc<Library>, api: Api, name: &str) -> Self {
        Self {
            library,
            api,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> (i32, i32, i32) {
        let (mut major, mut minor, mut patch) = (0, 0, 0);
        unsafe { (self.api.version)(&mut major, &mut minor, &mut patch) };
        (major, minor, patch)
    }

    pub fn constants(&self) -> Constants {
        unsafe {
            Constants {
                alpha: (self.api.alpha)(),
                planck: (self.api.planck)(),
                barn: (self.api.barn)(),
                fm: (self.api.fm)(),
                amu: (self.api.amu)(),
                infinity: (self.api.infinity)(),
            }
        }
    }

    /// Run one constructor: lower through `call`, lift the result and check
    fn construct<F>(&self, kind: FunctionKind, call: F) -> Result<Function, FfiError>
    where
        F: FnOnce(&mut CallScope) -> Result<Ptr, FfiError>,
    {
        let _call = error::enter();
        let mut scope = CallScope::new();
        scope.keep(KeepAlive::Library(self.library.clone()));
        let raw = call(&mut scope)?;
        let function = scope.lift(raw, kind)?;
        error::check()?;
        Ok(function)
    }

    // ------------------------------------------------------------------
    // Global settings (no error check)
    // ------------------------------------------------------------------

    pub fn default_settings(&self) -> IntegrationSettings {
        unsafe {
            IntegrationSettings {
                absolute_error: (self.api.get_default_absolute_error)(),
                relative_error: (self.api.get_default_relative_error)(),
                error_step: (self.api.get_default_error_step)(),
                method: IntegrationMethod::from_code((self.api.get_default_integration_method)())
                    .unwrap_or_default(),
                qag_limit: (self.api.get_default_integration_limit)(),
                cquad_limit: (self.api.get_default_cquad_integration_limit)(),
            }
        }
    }

    pub fn apply_default_settings(&self, settings: &IntegrationSettings) {
        unsafe {
            (self.api.set_default_absolute_error)(settings.absolute_error);
            (self.api.set_default_relative_error)(settings.relative_error);
            (self.api.set_default_error_step)(settings.error_step);
            (self.api.set_default_integration_method)(settings.method.code());
            (self.api.set_default_integration_limit)(settings.qag_limit);
            (self.api.set_default_cquad_integration_limit)(settings.cquad_limit);
        }
    }

    /// Whether native errors print a backtrace
    pub fn print_backtrace(&self) -> bool {
        unsafe { (self.api.get_print_backtrace)() != 0 }
    }

    pub fn set_print_backtrace(&self, enabled: bool) {
        unsafe { (self.api.set_print_backtrace)(c_int::from(enabled)) };
    }

    // ------------------------------------------------------------------
    // Integrators
    // ------------------------------------------------------------------

    pub fn qag_workspace(&self, limit: usize) -> Result<QagWorkspace, FfiError> {
        let _call = error::enter();
        let raw = unsafe { (self.api.make_qag_workspace)(limit) };
        self.workspace(raw, self.api.destroy_qag_workspace, limit).map(QagWorkspace)
    }

    pub fn cquad_workspace(&self, limit: usize) -> Result<CquadWorkspace, FfiError> {
        let _call = error::enter();
        let raw = unsafe { (self.api.make_cquad_workspace)(limit) };
        self.workspace(raw, self.api.destroy_cquad_workspace, limit).map(CquadWorkspace)
    }

    fn workspace(
        &self,
        raw: *mut c_void,
        destroy: unsafe extern "C" fn(*mut c_void),
        limit: usize,
    ) -> Result<Arc<Workspace>, FfiError> {
        match NonNull::new(raw) {
            Some(raw) => {
                let workspace = Arc::new(Workspace {
                    raw,
                    destroy,
                    limit,
                    _library: self.library.clone(),
                });
                error::check()?;
                Ok(workspace)
            }
            None => {
                error::check()?;
                Err(FfiError::NullFunction("integration workspace".to_string()))
            }
        }
    }

    /// Adaptive Gauss-Kronrod integrator; keeps its workspace alive
    pub fn qag_integrator(&self, options: &QagOptions) -> Result<Function, FfiError> {
        let defaults = self.default_settings();
        let absolute_error = options.absolute_error.unwrap_or(defaults.absolute_error);
        let relative_error = options.relative_error.unwrap_or(defaults.relative_error);
        let method = options.method.unwrap_or(defaults.method);

        self.construct(FunctionKind::Integrator, |scope| {
            let workspace = match &options.workspace {
                Some(workspace) => {
                    scope.keep(KeepAlive::Workspace(workspace.0.clone()));
                    workspace.0.raw.as_ptr()
                }
                None => ptr::null_mut(),
            };
            Ok(unsafe { (self.api.qag_integrator)(absolute_error, relative_error, method.code(), workspace) })
        })
    }

    /// Doubly adaptive integrator; keeps its workspace alive
    pub fn cquad_integrator(&self, options: &CquadOptions) -> Result<Function, FfiError> {
        let defaults = self.default_settings();
        let absolute_error = options.absolute_error.unwrap_or(defaults.absolute_error);
        let relative_error = options.relative_error.unwrap_or(defaults.relative_error);

        self.construct(FunctionKind::Integrator, |scope| {
            let workspace = match &options.workspace {
                Some(workspace) => {
                    scope.keep(KeepAlive::Workspace(workspace.0.clone()));
                    workspace.0.raw.as_ptr()
                }
                None => ptr::null_mut(),
            };
            Ok(unsafe { (self.api.cquad_integrator)(absolute_error, relative_error, workspace) })
        })
    }

    /// QAG integrator with a fresh workspace for one nesting level
    pub fn qag_integrator_for(&self, settings: &IntegrationSettings, level: u32) -> Result<Function, FfiError> {
        let workspace = self.qag_workspace(settings.qag_limit)?;
        self.qag_integrator(&QagOptions {
            absolute_error: Some(settings.absolute_error),
            relative_error: Some(settings.relative_error_for(level)),
            method: Some(settings.method),
            workspace: Some(workspace),
        })
    }

    /// Generator of QAG integrators with the library defaults, tightening
    /// the relative error by the default error step per level
    pub fn qag_integrator_generator(&self) -> Result<Function, FfiError> {
        let library = self.clone();
        integrator_generator(self.default_settings(), move |_, level| {
            let defaults = library.default_settings();
            library.qag_integrator(&QagOptions {
                relative_error: Some(defaults.relative_error_for(level)),
                ..QagOptions::default()
            })
        })
    }

    /// Generator of CQUAD integrators, as [`EpaLibrary::qag_integrator_generator`]
    pub fn cquad_integrator_generator(&self) -> Result<Function, FfiError> {
        let library = self.clone();
        integrator_generator(self.default_settings(), move |_, level| {
            let defaults = library.default_settings();
            library.cquad_integrator(&CquadOptions {
                relative_error: Some(defaults.relative_error_for(level)),
                ..CquadOptions::default()
            })
        })
    }

    // ------------------------------------------------------------------
    // Form factors and spectra
    // ------------------------------------------------------------------

    pub fn form_factor_monopole(&self, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |_| {
            Ok(unsafe { (self.api.form_factor_monopole)(lambda2) })
        })
    }

    pub fn form_factor_dipole(&self, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |_| {
            Ok(unsafe { (self.api.form_factor_dipole)(lambda2) })
        })
    }

    /// Photon spectrum `n(ω)` of a nucleus with charge `z` and Lorentz factor `gamma`
    ///
    /// `form_factor` and `integrator` may be host callables or `Value::Null`
    /// for the library defaults.
    pub fn spectrum(
        &self,
        z: u32,
        gamma: f64,
        form_factor: &Value,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |scope| {
            let form_factor = scope.lower_function(form_factor, FunctionKind::Function1d)?;
            let integrator = scope.lower_function(integrator, FunctionKind::Integrator)?;
            Ok(unsafe { (self.api.spectrum)(z, gamma, form_factor, integrator) })
        })
    }

    pub fn spectrum_monopole(&self, z: u32, gamma: f64, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |_| {
            Ok(unsafe { (self.api.spectrum_monopole)(z, gamma, lambda2) })
        })
    }

    pub fn spectrum_dipole(&self, z: u32, gamma: f64, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |_| {
            Ok(unsafe { (self.api.spectrum_dipole)(z, gamma, lambda2) })
        })
    }

    /// Impact-parameter dependent spectrum `n(ω, b)`
    pub fn spectrum_b(
        &self,
        z: u32,
        gamma: f64,
        form_factor: &Value,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |scope| {
            let form_factor = scope.lower_function(form_factor, FunctionKind::Function1d)?;
            let integrator = scope.lower_function(integrator, FunctionKind::Integrator)?;
            Ok(unsafe { (self.api.spectrum_b)(z, gamma, form_factor, integrator) })
        })
    }

    /// `n(ω, b)` of a point-like charge
    pub fn spectrum_b_point(&self, z: u32, gamma: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |_| {
            Ok(unsafe { (self.api.spectrum_b_point)(z, gamma) })
        })
    }

    pub fn spectrum_b_monopole(&self, z: u32, gamma: f64, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |_| {
            Ok(unsafe { (self.api.spectrum_b_monopole)(z, gamma, lambda2) })
        })
    }

    pub fn spectrum_b_dipole(&self, z: u32, gamma: f64, lambda2: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |_| {
            Ok(unsafe { (self.api.spectrum_b_dipole)(z, gamma, lambda2) })
        })
    }

    // ------------------------------------------------------------------
    // Luminosities
    // ------------------------------------------------------------------

    /// Two-photon luminosity; `spectrum2` may be `Value::Null` for `spectrum1`
    pub fn luminosity(
        &self,
        spectrum1: &Value,
        spectrum2: &Value,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |scope| {
            let (s1, s2) = scope.lower_pair(spectrum1, spectrum2, FunctionKind::Function1d)?;
            let integrator = scope.lower_function(integrator, FunctionKind::Integrator)?;
            Ok(unsafe { (self.api.luminosity)(s1, s2, integrator) })
        })
    }

    pub fn luminosity_y(&self, spectrum1: &Value, spectrum2: &Value) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |scope| {
            let (s1, s2) = scope.lower_pair(spectrum1, spectrum2, FunctionKind::Function1d)?;
            Ok(unsafe { (self.api.luminosity_y)(s1, s2) })
        })
    }

    pub fn luminosity_fid(
        &self,
        spectrum1: &Value,
        spectrum2: &Value,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function3d, |scope| {
            let (s1, s2) = scope.lower_pair(spectrum1, spectrum2, FunctionKind::Function1d)?;
            let integrator = scope.lower_function(integrator, FunctionKind::Integrator)?;
            Ok(unsafe { (self.api.luminosity_fid)(s1, s2, integrator) })
        })
    }

    /// Luminosity with survival probability `upc_probability(b)`
    pub fn luminosity_b(
        &self,
        spectrum1: &Value,
        spectrum2: &Value,
        upc_probability: &Value,
        generator: &Value,
        level: u32,
    ) -> Result<Function, FfiError> {
        self.luminosity_b_like(
            self.api.luminosity_b,
            FunctionKind::LuminosityBF,
            [spectrum1, spectrum2, upc_probability, generator],
            level,
        )
    }

    pub fn luminosity_y_b(
        &self,
        spectrum1: &Value,
        spectrum2: &Value,
        upc_probability: &Value,
        generator: &Value,
        level: u32,
    ) -> Result<Function, FfiError> {
        self.luminosity_b_like(
            self.api.luminosity_y_b,
            FunctionKind::LuminosityYBF,
            [spectrum1, spectrum2, upc_probability, generator],
            level,
        )
    }

    pub fn luminosity_fid_b(
        &self,
        spectrum1: &Value,
        spectrum2: &Value,
        upc_probability: &Value,
        generator: &Value,
        level: u32,
    ) -> Result<Function, FfiError> {
        self.luminosity_b_like(
            self.api.luminosity_fid_b,
            FunctionKind::LuminosityFidBF,
            [spectrum1, spectrum2, upc_probability, generator],
            level,
        )
    }

    fn luminosity_b_like(
        &self,
        entry: unsafe extern "C" fn(Ptr, Ptr, Ptr, Ptr, c_uint) -> Ptr,
        result: FunctionKind,
        [spectrum1, spectrum2, upc_probability, generator]: [&Value; 4],
        level: u32,
    ) -> Result<Function, FfiError> {
        self.construct(result, |scope| {
            let (s1, s2) = scope.lower_pair(spectrum1, spectrum2, FunctionKind::Function2d)?;
            let probability = scope.lower_function(upc_probability, FunctionKind::Function1d)?;
            let generator = scope.lower_function(generator, FunctionKind::IntegratorGenerator)?;
            Ok(unsafe { entry(s1, s2, probability, generator, level) })
        })
    }

    // ------------------------------------------------------------------
    // Cross sections
    // ------------------------------------------------------------------

    /// Convolve a photon-photon cross section with a luminosity
    pub fn xsection(&self, photons_xsection: &Value, luminosity: &Value) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |scope| {
            let xs = scope.lower_function(photons_xsection, FunctionKind::Function1d)?;
            let lum = scope.lower_function(luminosity, FunctionKind::Function1d)?;
            Ok(unsafe { (self.api.xsection)(xs, lum) })
        })
    }

    pub fn xsection_b(&self, photons_xsection: &Value, luminosity: &Value) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |scope| {
            let xs = scope.lower_function(photons_xsection, FunctionKind::XsectionBF)?;
            let lum = scope.lower_function(luminosity, FunctionKind::LuminosityBF)?;
            Ok(unsafe { (self.api.xsection_b)(xs, lum) })
        })
    }

    /// Fiducial cross section from `dσ/dpT` and a fiducial luminosity
    pub fn xsection_fid(
        &self,
        photons_xsection_pt: &Value,
        luminosity_fid: &Value,
        cuts: &FiducialCuts,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.xsection_fid_like(
            self.api.xsection_fid,
            [FunctionKind::Function2d, FunctionKind::Function3d],
            [photons_xsection_pt, luminosity_fid, integrator],
            cuts,
        )
    }

    pub fn xsection_fid_b(
        &self,
        photons_xsection_pt: &Value,
        luminosity_fid: &Value,
        cuts: &FiducialCuts,
        integrator: &Value,
    ) -> Result<Function, FfiError> {
        self.xsection_fid_like(
            self.api.xsection_fid_b,
            [FunctionKind::XsectionPtB, FunctionKind::LuminosityFidBF],
            [photons_xsection_pt, luminosity_fid, integrator],
            cuts,
        )
    }

    fn xsection_fid_like(
        &self,
        entry: XsectionFid,
        [xs_kind, lum_kind]: [FunctionKind; 2],
        [photons_xsection_pt, luminosity_fid, integrator]: [&Value; 3],
        cuts: &FiducialCuts,
    ) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |scope| {
            let xs = scope.lower_function(photons_xsection_pt, xs_kind)?;
            let lum = scope.lower_function(luminosity_fid, lum_kind)?;
            let integrator = scope.lower_function(integrator, FunctionKind::Integrator)?;
            Ok(unsafe {
                entry(
                    xs,
                    lum,
                    cuts.mass,
                    cuts.pt_min,
                    cuts.eta_max,
                    cuts.w1_min,
                    cuts.w1_max,
                    cuts.w2_min,
                    cuts.w2_max,
                    integrator,
                )
            })
        })
    }

    /// γγ → f f̄ cross section for a fermion of `mass` and `charge`
    pub fn photons_to_fermions(&self, mass: f64, charge: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function1d, |_| {
            Ok(unsafe { (self.api.photons_to_fermions)(mass, charge) })
        })
    }

    pub fn photons_to_fermions_pt(&self, mass: f64, charge: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::Function2d, |_| {
            Ok(unsafe { (self.api.photons_to_fermions_pt)(mass, charge) })
        })
    }

    pub fn photons_to_fermions_b(&self, mass: f64, charge: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::XsectionBF, |_| {
            Ok(unsafe { (self.api.photons_to_fermions_b)(mass, charge) })
        })
    }

    pub fn photons_to_fermions_pt_b(&self, mass: f64, charge: f64) -> Result<Function, FfiError> {
        self.construct(FunctionKind::XsectionPtB, |_| {
            Ok(unsafe { (self.api.photons_to_fermions_pt_b)(mass, charge) })
        })
    }
}
