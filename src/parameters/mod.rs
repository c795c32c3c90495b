//! # Parameter System
//!
//! Named, bounded parameters and the optimization space derived from them.
//!
//! - [`Parameter`]: a named scalar with a value, [`Bounds`] and a free flag
//! - [`Parameters`]: the problem's parameters in declaration order, with
//!   `.par` file and JSON persistence
//! - [`ParameterSpace`]: the fitted subset, frozen at optimization start,
//!   translating optimization vectors into full parameter vectors
//!
//! ## Example Usage
//!
//! ```rust
//! use reflfit::parameters::{Parameters, ParameterSpace};
//! use ndarray::array;
//!
//! let mut params = Parameters::new();
//! params.add_param_with_bounds("thickness", 50.0, 0.0, 200.0).unwrap();
//! params.add_fixed("substrate_rho", 2.07).unwrap();
//! params.add_param_with_bounds("roughness", 3.0, 0.0, 10.0).unwrap();
//!
//! let space = ParameterSpace::from_parameters(&params).unwrap();
//! assert_eq!(space.dim(), 2);
//! assert_eq!(space.expand(&array![60.0, 4.0]), array![60.0, 2.07, 4.0]);
//! ```

pub mod bounds;
pub mod parameter;
pub mod parameters;
pub mod space;

// Re-export key types
pub use bounds::{Bounds, BoundsError};
pub use parameter::{Parameter, ParameterError};
pub use parameters::Parameters;
pub use space::ParameterSpace;
