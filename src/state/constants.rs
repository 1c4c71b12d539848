//! Process-lifetime constants compared by identity.
//!
//! A constant is stored once at a fixed address and handed out as a
//! [`StableHandle`]. Handles are compared with [`StableHandle::same`] (or
//! [`identity_eq`]), which checks the address and never the content: two
//! constants holding the same text are different constants, and the same
//! constant fetched twice is the same one.
//!
//! `StableHandle` has no `PartialEq`; comparing contents
//! requires spelling out `a.get() == b.get()`.
//!
//! The registry is filled during startup through `&mut self` and is
//! read-only afterwards, so lookups take no lock. It refuses to register
//! one address under two names: the compiler may merge equal literals, and
//! two names sharing storage would compare identical.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::ptr;
use std::sync::OnceLock;

use super::error::ConfigurationError;
use super::field::StateField;
use super::tier::Tier;

/// Identity-comparable reference to a constant.
pub struct StableHandle<T: ?Sized + 'static> {
    value: &'static T,
}

impl<T: ?Sized + 'static> StableHandle<T> {
    /// Wrap a value that already has a stable address.
    pub const fn from_static(value: &'static T) -> Self {
        Self { value }
    }

    #[inline]
    pub fn get(&self) -> &'static T {
        self.value
    }

    /// Whether both handles name the same constant.
    #[inline]
    pub fn same(&self, other: &Self) -> bool {
        ptr::eq(self.value, other.value)
    }

    pub fn addr(&self) -> *const () {
        self.value as *const T as *const ()
    }
}

impl<T: ?Sized + 'static> Clone for StableHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized + 'static> Copy for StableHandle<T> {}

impl<T: ?Sized + fmt::Debug + 'static> fmt::Debug for StableHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StableHandle({:p} => {:?})", self.addr(), self.value)
    }
}

/// Identity comparison of two handles.
#[inline]
pub fn identity_eq<T: ?Sized + 'static>(a: StableHandle<T>, b: StableHandle<T>) -> bool {
    a.same(&b)
}

struct Entry {
    handle: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Named constants of one process.
#[derive(Default)]
pub struct ConstantRegistry {
    entries: HashMap<String, Entry>,
    // Address -> name registered there.
    addresses: HashMap<usize, String>,
    // Definition order, for reflection.
    order: Vec<String>,
}

impl ConstantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value that already lives for the whole process.
    ///
    /// Fails if the value's address is already registered under another
    /// name; use [`define_owned`](Self::define_owned) to give equal values
    /// their own storage.
    pub fn define<T: ?Sized + Sync + 'static>(
        &mut self,
        name: &str,
        value: &'static T,
    ) -> Result<StableHandle<T>, ConfigurationError> {
        if self.entries.contains_key(name) {
            return Err(ConfigurationError::DuplicateConstant(name.to_string()));
        }
        let handle = StableHandle::from_static(value);
        let addr = handle.addr() as usize;
        if let Some(existing) = self.addresses.get(&addr) {
            return Err(ConfigurationError::AliasedConstant {
                name: name.to_string(),
                existing: existing.clone(),
            });
        }
        self.addresses.insert(addr, name.to_string());
        self.entries.insert(
            name.to_string(),
            Entry {
                handle: Box::new(handle),
                type_name: type_name::<T>(),
            },
        );
        self.order.push(name.to_string());
        Ok(handle)
    }

    /// Move `value` to a fresh, never-freed allocation and register it.
    ///
    /// Zero-sized values are rejected: they have no distinct address.
    pub fn define_owned<T: Send + Sync + 'static>(
        &mut self,
        name: &str,
        value: T,
    ) -> Result<StableHandle<T>, ConfigurationError> {
        if std::mem::size_of::<T>() == 0 {
            return Err(ConfigurationError::InvalidConstant(name.to_string()));
        }
        if self.entries.contains_key(name) {
            return Err(ConfigurationError::DuplicateConstant(name.to_string()));
        }
        let value: &'static T = Box::leak(Box::new(value));
        self.define(name, value)
    }

    /// The handle registered under `name`, if it has type `T`.
    pub fn lookup<T: ?Sized + 'static>(&self, name: &str) -> Option<StableHandle<T>> {
        self.entries
            .get(name)
            .and_then(|entry| entry.handle.downcast_ref::<StableHandle<T>>())
            .copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reflected declarations, one unlocked global per constant.
    pub fn declarations(&self) -> Vec<StateField> {
        self.order
            .iter()
            .filter_map(|name| {
                let entry = self.entries.get(name)?;
                Some(StateField::new(name.clone(), Tier::Global, entry.type_name).constant())
            })
            .collect()
    }
}

impl fmt::Debug for ConstantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.order.iter()).finish()
    }
}

/// Constants every process starts with.
pub struct Builtins {
    /// Canonical true value, `"1"`.
    pub yes: StableHandle<String>,
    /// Canonical false value, the empty string.
    pub no: StableHandle<String>,
    /// Hex digits, lower then upper case.
    pub hexdigit: StableHandle<String>,
    /// Characters left untouched when quoting a pattern.
    pub patleave: StableHandle<String>,
    registry: ConstantRegistry,
}

impl Builtins {
    fn build() -> Result<Self, ConfigurationError> {
        let mut registry = ConstantRegistry::new();
        let yes = registry.define_owned("Yes", String::from("1"))?;
        let no = registry.define_owned("No", String::new())?;
        let hexdigit =
            registry.define_owned("hexdigit", String::from("0123456789abcdef0123456789ABCDEF"))?;
        let patleave = registry.define_owned(
            "patleave",
            String::from("\\.^$@dDwWsSbB+*?|()-nrtfeaxc0123456789[{]}"),
        )?;
        Ok(Self {
            yes,
            no,
            hexdigit,
            patleave,
            registry,
        })
    }

    pub fn registry(&self) -> &ConstantRegistry {
        &self.registry
    }
}

static BUILTINS: OnceLock<Result<Builtins, ConfigurationError>> = OnceLock::new();

/// The built-in constants, created on first use and never freed.
pub fn builtins() -> Result<&'static Builtins, ConfigurationError> {
    BUILTINS
        .get_or_init(Builtins::build)
        .as_ref()
        .map_err(Clone::clone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_constant_twice_is_identical() {
        let b = builtins().unwrap();
        let again = b.registry().lookup::<String>("Yes").unwrap();
        assert!(identity_eq(b.yes, again));
        assert_eq!(again.get(), "1");
    }

    #[test]
    fn test_equal_content_is_not_identical() {
        let mut registry = ConstantRegistry::new();
        let one = registry.define_owned("one", String::from("1")).unwrap();
        let yes = builtins().unwrap().yes;
        assert_eq!(one.get(), yes.get());
        assert!(!one.same(&yes));
    }

    #[test]
    fn test_empty_constants_stay_distinct() {
        let mut registry = ConstantRegistry::new();
        let a = registry.define_owned("a", String::new()).unwrap();
        let b = registry.define_owned("b", String::new()).unwrap();
        assert!(!a.same(&b));
        assert!(!a.same(&builtins().unwrap().no));
    }

    #[test]
    fn test_redefinition_rejected() {
        let mut registry = ConstantRegistry::new();
        registry.define("pi", &2.5f64).unwrap();
        assert_eq!(
            registry.define("pi", &1.5f64).unwrap_err(),
            ConfigurationError::DuplicateConstant("pi".to_string())
        );
    }

    #[test]
    fn test_equal_literals_cannot_share_identity() {
        let mut registry = ConstantRegistry::new();
        let empty_a = registry.define::<str>("empty_a", "").unwrap();
        let one_a = registry.define::<str>("one_a", "1").unwrap();

        // Equal literals may or may not be merged; either way the two names
        // never compare identical.
        match registry.define::<str>("empty_b", "") {
            Ok(empty_b) => assert!(!empty_a.same(&empty_b)),
            Err(err) => assert_eq!(
                err,
                ConfigurationError::AliasedConstant {
                    name: "empty_b".to_string(),
                    existing: "empty_a".to_string(),
                }
            ),
        }
        match registry.define::<str>("one_b", "1") {
            Ok(one_b) => assert!(!one_a.same(&one_b)),
            Err(err) => assert_eq!(
                err,
                ConfigurationError::AliasedConstant {
                    name: "one_b".to_string(),
                    existing: "one_a".to_string(),
                }
            ),
        }
    }

    #[test]
    fn test_same_static_under_two_names_rejected() {
        static SHARED: &str = "shared";
        let mut registry = ConstantRegistry::new();
        registry.define::<str>("first", SHARED).unwrap();
        assert_eq!(
            registry.define::<str>("second", SHARED).unwrap_err(),
            ConfigurationError::AliasedConstant {
                name: "second".to_string(),
                existing: "first".to_string(),
            }
        );
        assert!(!registry.contains("second"));

        // Owned definitions always get fresh storage.
        let a = registry.define_owned("third", String::from("shared")).unwrap();
        let b = registry.define_owned("fourth", String::from("shared")).unwrap();
        assert!(!a.same(&b));
    }

    #[test]
    fn test_zero_sized_rejected() {
        let mut registry = ConstantRegistry::new();
        assert!(matches!(
            registry.define_owned("unit", ()),
            Err(ConfigurationError::InvalidConstant(_))
        ));
    }

    #[test]
    fn test_lookup_checks_type() {
        let mut registry = ConstantRegistry::new();
        registry.define::<str>("greeting", "hello").unwrap();
        assert!(registry.lookup::<str>("greeting").is_some());
        assert!(registry.lookup::<String>("greeting").is_none());
        assert!(registry.lookup::<str>("missing").is_none());
    }

    #[test]
    fn test_declarations_are_constant_globals() {
        let decls = builtins().unwrap().registry().declarations();
        let names: Vec<_> = decls.iter().map(|f| f.name.as_ref()).collect();
        assert_eq!(names, vec!["Yes", "No", "hexdigit", "patleave"]);
        assert!(decls.iter().all(|f| f.constant && f.tier == Tier::Global));
    }
}
