//! Numerical building blocks for the red-sequence cluster finder.
//!
//! Nothing in this crate knows about galaxies or clusters:
//!
//! - [`spline`]: natural cubic splines over redshift nodes and joint
//!   least-squares fitting of sums of splines
//! - [`interp`]: tabulated functions with linear interpolation
//! - [`integrate`]: trapezoid rules
//! - [`optimize`]: parabola peak refinement and bisection
//! - [`stats`]: medians and robust scatter estimates

pub mod integrate;
pub mod interp;
pub mod optimize;
pub mod spline;
pub mod stats;

pub use interp::{InterpError, LinearTable};
pub use spline::{make_nodes, Extrapolation, SplineError, SplineFitter, SplineModel, SplineTerm};
