//! Combined maximum-likelihood fitting of an instrument point-spread function from stacked
//! angular separations: on/off-pulse pulsar photons alongside background-dominated point
//! sources with optional extended halos.

#![allow(clippy::too_many_arguments)]

pub mod background;
pub mod binning;
pub mod conic;
pub mod file;
pub mod fit;
pub mod halo;
pub mod layout;
pub mod likelihood;
pub mod linear;
pub mod opt;
pub mod print;
pub mod psf;
pub mod uncertainty;

#[doc = include_str!("../../README.md")]
#[cfg(doc)]
fn readme() {}
