//! The `state_vars!` declaration macro.
//!
//! One invocation declares every field of one tier and generates, per field:
//!
//! - the struct field, wrapped in [`Guarded`](super::Guarded) or
//!   [`ReadMostly`](super::ReadMostly) when a lock clause is present
//! - an accessor pair: `name()` and `set_name(value)`, plus `name_mut()`
//! - a [`StateField`](super::StateField) entry in `declarations()`
//!
//! A `#[cfg(...)]` on a field is applied identically to the field, its
//! initializer, its accessors, and its declaration entry, so a field that is
//! compiled out is never referenced by anything compiled in.
//!
//! ```ignore
//! state_vars! {
//!     /// Per-thread interpreter variables.
//!     pub struct ThreadVars: PerThread {
//!         /// Current call depth.
//!         stack_depth: usize = 0,
//!         @persistent locale: Option<String> = None,
//!     }
//! }
//!
//! state_vars! {
//!     pub struct Shared: Global {
//!         @export program_name: String = String::new() => locked(LockId::PROGRAM_NAME),
//!         #[cfg(feature = "threads")]
//!         op_refcounts: OpRefTable = OpRefTable::default() => locked(LockId::OP_REFCOUNT),
//!     }
//! }
//! ```
//!
//! Flags (`@export`, `@persistent`, `@constant`) map onto the builder methods
//! of `StateField`, so an unknown flag is a compile error. The tier must be
//! one of `Global`, `PerInstance`, `PerThread`; omitting it does not parse.

#[macro_export]
macro_rules! state_vars {
    (@cell $ty:ty) => { $ty };
    (@cell $ty:ty, locked) => { $crate::state::Guarded<$ty> };
    (@cell $ty:ty, read_mostly) => { $crate::state::ReadMostly<$ty> };

    (@init $init:expr) => { $init };
    (@init $init:expr, locked($lock:expr)) => {
        $crate::state::Guarded::new($lock, $init)
    };
    (@init $init:expr, read_mostly($lock:expr)) => {
        $crate::state::ReadMostly::new($lock, $init)
    };

    (@protection) => { $crate::state::Protection::None };
    (@protection locked($lock:expr)) => {
        $crate::state::Protection::Mutex($crate::state::LockRef::from($lock))
    };
    (@protection read_mostly($lock:expr)) => {
        $crate::state::Protection::ReadMostly($crate::state::LockRef::from($lock))
    };

    (@slot $slot:expr, $value:expr) => { ::std::mem::replace(&mut $slot, $value) };
    (@slot $slot:expr, $value:expr, locked) => {
        ::std::mem::replace($slot.get_mut(), $value)
    };
    (@slot $slot:expr, $value:expr, read_mostly) => {
        ::std::mem::replace($slot.get_mut(), $value)
    };

    (@persistent) => { false };
    (@persistent persistent $($rest:ident)*) => { true };
    (@persistent $other:ident $($rest:ident)*) => {
        $crate::state_vars!(@persistent $($rest)*)
    };

    (
        $(#[doc = $sdoc:literal])*
        $vis:vis struct $Struct:ident : $tier:ident {
            $(
                $(#[doc = $doc:literal])*
                $(#[cfg($cfg:meta)])?
                $(@ $flag:ident)*
                $name:ident : $ty:ty = $init:expr $(=> $proto:ident ( $lock:expr ))?
            ),* $(,)?
        }
    ) => {
        $(#[doc = $sdoc])*
        $vis struct $Struct {
            $(
                $(#[doc = $doc])*
                $(#[cfg($cfg)])?
                $name: $crate::state_vars!(@cell $ty $(, $proto)?),
            )*
        }

        impl $Struct {
            /// Tier every field of this struct belongs to.
            pub const TIER: $crate::state::Tier = $crate::state::Tier::$tier;

            /// Construct every compiled-in field from its initializer.
            pub fn new() -> Self {
                Self {
                    $(
                        $(#[cfg($cfg)])?
                        $name: $crate::state_vars!(@init $init $(, $proto($lock))?),
                    )*
                }
            }

            $crate::paste::paste! {
                $(
                    $(#[doc = $doc])*
                    $(#[cfg($cfg)])?
                    #[inline]
                    pub fn $name(&self) -> &$crate::state_vars!(@cell $ty $(, $proto)?) {
                        &self.$name
                    }

                    /// Mutable access to the field.
                    $(#[cfg($cfg)])?
                    #[inline]
                    pub fn [<$name _mut>](&mut self) -> &mut $crate::state_vars!(@cell $ty $(, $proto)?) {
                        &mut self.$name
                    }

                    /// Replace the field's value, returning the previous one.
                    $(#[cfg($cfg)])?
                    #[inline]
                    pub fn [<set_ $name>](&mut self, value: $ty) -> $ty {
                        $crate::state_vars!(@slot self.$name, value $(, $proto)?)
                    }
                )*
            }

            /// Reflected declarations for every compiled-in field, in
            /// declaration order.
            #[allow(unused_mut)]
            pub fn declarations() -> ::std::vec::Vec<$crate::state::StateField> {
                let mut fields = ::std::vec::Vec::new();
                $(
                    $(#[cfg($cfg)])?
                    fields.push(
                        $crate::state::StateField::new(
                            stringify!($name),
                            $crate::state::Tier::$tier,
                            stringify!($ty),
                        )
                        .initializer(stringify!($init))
                        .protection($crate::state_vars!(@protection $($proto($lock))?))
                        $(.guarded(stringify!($cfg)))?
                        $(.$flag())*
                    );
                )*
                fields
            }

            /// Move every persistent field from `previous` into `self`.
            #[allow(unused_variables)]
            pub fn carry_persistent(&mut self, previous: &mut Self) {
                $(
                    $(#[cfg($cfg)])?
                    {
                        if $crate::state_vars!(@persistent $($flag)*) {
                            ::std::mem::swap(&mut self.$name, &mut previous.$name);
                        }
                    }
                )*
            }
        }

        impl ::std::default::Default for $Struct {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}
