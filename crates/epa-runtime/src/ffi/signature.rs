//! Type descriptors: canonical C signatures of function objects
//!
//! Accepted spellings:
//! - a registered function object pointer type: `epa_function1d*`
//! - a C function type: `double (double, double)`
//! - a C function pointer type: `double (*)(double)`
//!
//! Function types are normalized with a trailing `void*` user data
//! parameter, so `double (double)` and `double(double, void*)` denote the
//! same descriptor. Descriptors are interned: resolving the same normalized
//! text twice yields the same `Arc`.

use crate::ffi::error::FfiError;
use crate::ffi::types::{ExternType, FunctionKind};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Result and parameter types of a function object's function pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    result: ExternType,
    /// Includes the trailing user data parameter
    params: Vec<ExternType>,
}

impl Signature {
    pub fn new(result: ExternType, leading: &[ExternType]) -> Self {
        let mut params = leading.to_vec();
        params.push(ExternType::COpaque);
        Self { result, params }
    }

    pub fn for_kind(kind: FunctionKind) -> Self {
        Self::new(kind.result(), kind.params())
    }

    pub fn result(&self) -> ExternType {
        self.result
    }

    pub fn params(&self) -> &[ExternType] {
        &self.params
    }

    /// Parameters supplied by callers, without the user data pointer
    pub fn leading_params(&self) -> &[ExternType] {
        &self.params[..self.params.len() - 1]
    }

    pub fn arity(&self) -> usize {
        self.params.len() - 1
    }

    /// Whether any parameter or the result is a function object
    pub fn requires_conversion(&self) -> bool {
        self.result.is_function() || self.leading_params().iter().any(ExternType::is_function)
    }

    /// Registered kind whose function pointer has this signature
    pub fn kind(&self) -> Option<FunctionKind> {
        FunctionKind::ALL
            .into_iter()
            .find(|kind| kind.result() == self.result && kind.params() == self.leading_params())
    }

    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.result)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", param)?;
        }
        f.write_str(")")
    }
}

/// What a type text denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Pointer to a registered function object type
    FunctionPointer(FunctionKind),
    /// Bare C function type
    Function,
}

/// Canonical, interned description of a function object type
#[derive(Debug, PartialEq)]
pub struct TypeDescriptor {
    canonical: String,
    signature_text: String,
    kind: TypeKind,
    signature: Signature,
    shape: FunctionKind,
}

impl TypeDescriptor {
    fn for_kind(kind: FunctionKind) -> Self {
        let signature = Signature::for_kind(kind);
        Self {
            canonical: format!("{}*", kind.c_name()),
            signature_text: signature.canonical(),
            kind: TypeKind::FunctionPointer(kind),
            signature,
            shape: kind,
        }
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Canonical text of the function signature (shared by all spellings)
    pub fn signature_text(&self) -> &str {
        &self.signature_text
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Function object kind with the same calling signature
    pub fn shape(&self) -> FunctionKind {
        self.shape
    }

    /// Whether this type names a registered native function object type
    pub fn is_function_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::FunctionPointer(_))
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

type DescriptorMap = HashMap<String, Arc<TypeDescriptor>>;

static DESCRIPTORS: OnceLock<Mutex<DescriptorMap>> = OnceLock::new();

thread_local! {
    // Keyed by both the text as given and the canonical text
    static LOCAL_DESCRIPTORS: RefCell<DescriptorMap> = RefCell::new(HashMap::new());
}

/// Resolve type text to its interned descriptor
pub fn resolve(text: &str) -> Result<Arc<TypeDescriptor>, FfiError> {
    if let Some(found) = LOCAL_DESCRIPTORS.with(|local| local.borrow().get(text).cloned()) {
        return Ok(found);
    }

    let descriptor = parse(text)?;
    let interned = intern(descriptor);
    LOCAL_DESCRIPTORS.with(|local| {
        let mut local = local.borrow_mut();
        local.insert(text.to_string(), interned.clone());
        local.insert(interned.canonical.clone(), interned.clone());
    });
    Ok(interned)
}

/// Descriptor attached to a native function object kind
pub fn descriptor_for_kind(kind: FunctionKind) -> Arc<TypeDescriptor> {
    let key = format!("{}*", kind.c_name());
    if let Some(found) = LOCAL_DESCRIPTORS.with(|local| local.borrow().get(&key).cloned()) {
        return found;
    }

    let interned = intern(TypeDescriptor::for_kind(kind));
    LOCAL_DESCRIPTORS.with(|local| local.borrow_mut().insert(key, interned.clone()));
    interned
}

/// Number of distinct descriptors interned process-wide
pub fn descriptor_count() -> usize {
    registry().lock().unwrap_or_else(PoisonError::into_inner).len()
}

fn registry() -> &'static Mutex<DescriptorMap> {
    DESCRIPTORS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn intern(descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    map.entry(descriptor.canonical.clone())
        .or_insert_with(|| {
            tracing::debug!(target: "epa::ffi::signature", canonical = %descriptor.canonical, "type descriptor interned");
            Arc::new(descriptor)
        })
        .clone()
}

fn invalid(text: &str, reason: impl Into<String>) -> FfiError {
    FfiError::InvalidSignature {
        signature: text.to_string(),
        reason: reason.into(),
    }
}

/// Collapse whitespace and attach `*` to the preceding name
fn normalize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.replace(" *", "*").replace("( ", "(").replace(" )", ")")
}

fn parse(text: &str) -> Result<TypeDescriptor, FfiError> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return Err(invalid(text, "empty type"));
    }

    let Some(open) = normalized.find('(') else {
        return match parse_type(&normalized) {
            Some(ExternType::Function(kind)) => Ok(TypeDescriptor::for_kind(kind)),
            Some(other) => Err(invalid(text, format!("'{}' is not a function type", other))),
            None => Err(invalid(text, format!("unknown type '{}'", normalized))),
        };
    };

    let result_text = normalized[..open].trim();
    let mut rest = normalized[open..].trim_start();

    // Function pointer declarator: RESULT (*)(PARAMS)
    if let Some(after) = rest.strip_prefix("(*)") {
        rest = after.trim_start();
    }

    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| invalid(text, "expected a parameter list"))?;
    if inner.contains('(') || inner.contains(')') {
        return Err(invalid(text, "nested function types must use a registered pointer type"));
    }

    let result = parse_type(result_text)
        .ok_or_else(|| invalid(text, format!("unknown result type '{}'", result_text)))?;
    if result == ExternType::COpaque {
        return Err(invalid(text, "void* results are not supported"));
    }

    let mut params = Vec::new();
    let inner = inner.trim();
    if !inner.is_empty() && inner != "void" {
        for param in inner.split(',') {
            let param = param.trim();
            match parse_type(param) {
                Some(ExternType::CVoid) => return Err(invalid(text, "void parameter in a list")),
                Some(ty) => params.push(ty),
                None => return Err(invalid(text, format!("unknown parameter type '{}'", param))),
            }
        }
    }

    // An explicit trailing void* is the user data parameter
    if params.last() == Some(&ExternType::COpaque) {
        params.pop();
    }
    if params.contains(&ExternType::COpaque) {
        return Err(invalid(text, "void* is only allowed as the trailing user data parameter"));
    }

    let signature = Signature::new(result, &params);
    let shape = signature
        .kind()
        .ok_or_else(|| invalid(text, format!("no trampoline for signature '{}'", signature)))?;
    let canonical = signature.canonical();

    Ok(TypeDescriptor {
        signature_text: canonical.clone(),
        canonical,
        kind: TypeKind::Function,
        signature,
        shape,
    })
}

fn parse_type(text: &str) -> Option<ExternType> {
    match text {
        "double" => Some(ExternType::CDouble),
        "unsigned" | "unsigned int" => Some(ExternType::CUnsigned),
        "int" => Some(ExternType::CInt),
        "epa_polarization" => Some(ExternType::CPolarization),
        "void" => Some(ExternType::CVoid),
        "void*" => Some(ExternType::COpaque),
        _ => text
            .strip_suffix('*')
            .map(str::trim_end)
            .and_then(FunctionKind::from_c_name)
            .map(ExternType::Function),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("double (double)", "double (double, void*)")]
    #[case("double(double,void*)", "double (double, void*)")]
    #[case("  double   ( double ,  double )  ", "double (double, double, void*)")]
    #[case("double (*)(double, double, double)", "double (double, double, double, void*)")]
    #[case(
        "double (epa_function1d *, double, double)",
        "double (epa_function1d*, double, double, void*)"
    )]
    #[case("epa_integrator* (unsigned int)", "epa_integrator* (unsigned, void*)")]
    #[case("epa_polarization (double)", "epa_polarization (double, void*)")]
    #[case("epa_function2d *", "epa_function2d*")]
    fn test_canonical_forms(#[case] text: &str, #[case] canonical: &str) {
        assert_eq!(resolve(text).unwrap().canonical(), canonical);
    }

    #[rstest]
    #[case("")]
    #[case("double")]
    #[case("double (float)")]
    #[case("double (double")]
    #[case("epa_function4d*")]
    #[case("void* (double)")]
    #[case("double (void*, double)")]
    #[case("double (double, void)")]
    #[case("int (int)")]
    #[case("double (double (*)(double))")]
    fn test_invalid_signatures(#[case] text: &str) {
        assert!(matches!(resolve(text), Err(FfiError::InvalidSignature { .. })));
    }

    #[test]
    fn test_resolve_is_interned() {
        let a = resolve("double (double, double)").unwrap();
        let b = resolve("double(double,double,void*)").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_interned_across_threads() {
        let here = resolve("double (double, epa_polarization)").unwrap();
        let there = std::thread::spawn(|| resolve("double(double, epa_polarization, void *)").unwrap())
            .join()
            .unwrap();
        assert!(Arc::ptr_eq(&here, &there));
    }

    #[test]
    fn test_descriptor_for_kind_matches_text() {
        let from_kind = descriptor_for_kind(FunctionKind::Integrator);
        let from_text = resolve("epa_integrator*").unwrap();
        assert!(Arc::ptr_eq(&from_kind, &from_text));
        assert!(from_kind.is_function_pointer());
        assert_eq!(from_kind.shape(), FunctionKind::Integrator);
    }

    #[test]
    fn test_function_type_shares_signature_with_kind() {
        let bare = resolve("double (double)").unwrap();
        let pointer = descriptor_for_kind(FunctionKind::Function1d);
        assert!(!bare.is_function_pointer());
        assert_eq!(bare.shape(), pointer.shape());
        assert_eq!(bare.signature_text(), pointer.signature_text());
        assert!(!Arc::ptr_eq(&bare, &pointer));
    }

    #[test]
    fn test_requires_conversion() {
        assert!(!Signature::for_kind(FunctionKind::Function3d).requires_conversion());
        assert!(!Signature::for_kind(FunctionKind::XsectionPtB).requires_conversion());
        assert!(Signature::for_kind(FunctionKind::Integrator).requires_conversion());
        assert!(Signature::for_kind(FunctionKind::IntegratorGenerator).requires_conversion());
    }

    #[test]
    fn test_signature_arity() {
        let sig = Signature::for_kind(FunctionKind::LuminosityFidBF);
        assert_eq!(sig.arity(), 4);
        assert_eq!(sig.params().len(), 5);
        assert_eq!(sig.params()[4], ExternType::COpaque);
    }
}
