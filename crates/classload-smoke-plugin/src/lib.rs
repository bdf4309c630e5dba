//! Smoke-test plugin.
//!
//! Registers a couple of shapes under `geometry.Shape` and one of them again
//! under `geometry.Describe`. Built as a cdylib it exports the standard entry
//! points; as an rlib the same registration function can be handed to a
//! [`StaticLibraryBackend`](classload_core::StaticLibraryBackend).

use classload_core::prelude::*;

/// A plane shape.
pub trait Shape: Send {
    fn name(&self) -> &str;
    fn area(&self) -> f64;
    fn sides(&self) -> u32;
}

declare_interface!(dyn Shape, "geometry.Shape");

/// Something that can describe itself.
pub trait Describe: Send {
    fn describe(&self) -> String;
}

declare_interface!(dyn Describe, "geometry.Describe");

#[derive(Debug)]
pub struct Square {
    side: f64,
}

impl Default for Square {
    fn default() -> Self {
        Self { side: 2.0 }
    }
}

impl Shape for Square {
    fn name(&self) -> &str {
        "square"
    }

    fn area(&self) -> f64 {
        self.side * self.side
    }

    fn sides(&self) -> u32 {
        4
    }
}

impl Describe for Square {
    fn describe(&self) -> String {
        format!("square with side {}", self.side)
    }
}

#[derive(Debug)]
pub struct Circle {
    radius: f64,
}

impl Default for Circle {
    fn default() -> Self {
        Self { radius: 1.0 }
    }
}

impl Shape for Circle {
    fn name(&self) -> &str {
        "circle"
    }

    fn area(&self) -> f64 {
        std::f64::consts::PI * self.radius * self.radius
    }

    fn sides(&self) -> u32 {
        0
    }
}

/// Register every class this plugin provides.
pub fn register_classes(registrar: &Registrar<'_>) -> Result<()> {
    register_class!(registrar, dyn Shape, Square, "Square")?;
    register_class!(registrar, dyn Shape, Circle, "Circle")?;
    register_class!(registrar, dyn Describe, Square, "Square")?;
    Ok(())
}

export_plugin!(register_classes);
