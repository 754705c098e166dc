pub mod vast;
