//! # stoat-core
//!
//! Backend-agnostic core of the Stoat tensor compute engine.
//!
//! This crate provides:
//! - [`Tensor`] — typed, strided n-dimensional array on a backend device
//! - [`Shape`] / [`Layout`] — shape, strides, and memory layout
//! - [`DType`] — element types (F16, F32, F64)
//! - [`Backend`] trait — the capability interface both devices implement
//! - [`ConvLayer`] / [`PoolLayer`] — layer shape descriptors shared by all
//!   backends
//! - [`Graph`] — the lazy operation tree and its plan compiler
//! - [`kernels`] — validated convolution/pooling kernel entry points

pub mod backend;
pub mod conv;
pub mod dtype;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod optree;
pub mod pool;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use conv::ConvLayer;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use optree::{BinOp, Graph, MapInstr, MapStep, NodeId, Plan, PlanView, ReduceOp, Step, ValueRef};
pub use pool::{PoolLayer, PoolOp};
pub use shape::Shape;
pub use tensor::Tensor;
