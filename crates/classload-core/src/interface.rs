//! Base interface identifiers.
//!
//! Every abstract interface that plugin classes implement carries an explicit,
//! assigned identifier. The registry keys its class maps by that string, so a
//! host and a plugin agree on an interface as long as they agree on its id.

/// An abstract interface that plugin classes can be registered under.
///
/// Usually implemented for a trait object type with [`declare_interface!`]:
///
/// ```rust
/// use classload_core::declare_interface;
///
/// pub trait Shape: Send {
///     fn area(&self) -> f64;
/// }
///
/// declare_interface!(dyn Shape, "geometry.Shape");
/// ```
pub trait Interface: 'static {
    /// Stable identifier used as the registry key.
    const ID: &'static str;
}

/// Assign an interface identifier to a type.
#[macro_export]
macro_rules! declare_interface {
    ($ty:ty, $id:expr) => {
        impl $crate::Interface for $ty {
            const ID: &'static str = $id;
        }
    };
}
