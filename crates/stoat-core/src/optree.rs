use std::collections::HashMap;

use crate::backend::{Backend, BackendDevice};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;
use crate::tensor::Tensor;

// Operation tree — lazy DAG of elementwise/reduction/dot operations
//
// Consumers build an expression through the Graph's builder methods; no
// numeric work happens until `eval` is called on a root node. The graph is
// an arena: nodes are indexed by NodeId in a flat table, so a shared
// subexpression is simply a NodeId referenced by several parents and reuse
// detection is id equality.
//
// Evaluation compiles the reachable DAG into a Plan — a short sequence of
// steps over value slots:
//
//   Map    one fused pass over any number of input views producing one
//          materialized buffer; maximal elementwise regions collapse into
//          a single Map, so their intermediates never materialize
//   Reduce reduction of one view along an optional axis
//   Dot    2-D matrix product of two views
//
// Transpose never becomes a step: it folds into the strides of whichever
// view consumes it. Broadcasting likewise folds into per-input strides
// with zero-stride repetition. Each backend executes the same Plan with
// its own machinery, which is what keeps the two devices numerically
// aligned on compound expressions.

/// Handle to a node in the operation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Reduction operators over an optional axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
    /// Population variance.
    Var,
    /// Population standard deviation.
    Std,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(usize),
    Scalar(f64),
    Binary {
        op: BinOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Reduce {
        op: ReduceOp,
        arg: NodeId,
        axis: Option<usize>,
        keepdims: bool,
    },
    Dot {
        lhs: NodeId,
        rhs: NodeId,
    },
    Transpose(NodeId),
}

/// Lazy operation graph over tensors of one backend.
pub struct Graph<B: Backend> {
    nodes: Vec<Node>,
    shapes: Vec<Shape>,
    leaves: Vec<Tensor<B>>,
}

impl<B: Backend> Default for Graph<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Graph<B> {
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            shapes: Vec::new(),
            leaves: Vec::new(),
        }
    }

    fn push(&mut self, node: Node, shape: Shape) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        self.shapes.push(shape);
        id
    }

    /// The shape a node will materialize to.
    pub fn shape(&self, id: NodeId) -> &Shape {
        &self.shapes[id.0]
    }

    // Builders

    /// Register a tensor as a leaf of the graph.
    pub fn leaf(&mut self, t: &Tensor<B>) -> NodeId {
        let index = self.leaves.len();
        self.leaves.push(t.clone());
        let shape = t.shape().clone();
        self.push(Node::Leaf(index), shape)
    }

    /// A scalar constant (broadcasts against anything).
    pub fn scalar(&mut self, v: f64) -> NodeId {
        self.push(Node::Scalar(v), Shape::from(()))
    }

    fn binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let shape = Shape::broadcast_shape(&self.shapes[lhs.0], &self.shapes[rhs.0])?;
        Ok(self.push(Node::Binary { op, lhs, rhs }, shape))
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        self.binary(BinOp::Div, lhs, rhs)
    }

    fn reduce(
        &mut self,
        op: ReduceOp,
        arg: NodeId,
        axis: Option<usize>,
        keepdims: bool,
    ) -> Result<NodeId> {
        let in_shape = &self.shapes[arg.0];
        let out_shape = match axis {
            None => {
                if keepdims {
                    Shape::new(vec![1; in_shape.rank()])
                } else {
                    Shape::from(())
                }
            }
            Some(a) => {
                if a >= in_shape.rank() {
                    return Err(Error::DimOutOfRange {
                        dim: a,
                        rank: in_shape.rank(),
                    });
                }
                let mut dims = in_shape.dims().to_vec();
                if keepdims {
                    dims[a] = 1;
                } else {
                    dims.remove(a);
                }
                Shape::new(dims)
            }
        };
        Ok(self.push(
            Node::Reduce {
                op,
                arg,
                axis,
                keepdims,
            },
            out_shape,
        ))
    }

    pub fn sum(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Sum, arg, axis, keepdims)
    }

    pub fn mean(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Mean, arg, axis, keepdims)
    }

    pub fn max(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Max, arg, axis, keepdims)
    }

    pub fn min(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Min, arg, axis, keepdims)
    }

    pub fn var(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Var, arg, axis, keepdims)
    }

    pub fn std(&mut self, arg: NodeId, axis: Option<usize>, keepdims: bool) -> Result<NodeId> {
        self.reduce(ReduceOp::Std, arg, axis, keepdims)
    }

    /// 2-D matrix product.
    pub fn dot(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId> {
        let l = &self.shapes[lhs.0];
        let r = &self.shapes[rhs.0];
        if l.rank() != 2 || r.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: l.rank().max(r.rank()),
            });
        }
        let (m, k1) = (l.dims()[0], l.dims()[1]);
        let (k2, n) = (r.dims()[0], r.dims()[1]);
        if k1 != k2 {
            return Err(Error::DotShapeMismatch { m, k1, k2, n });
        }
        Ok(self.push(Node::Dot { lhs, rhs }, Shape::from((m, n))))
    }

    /// 2-D transposed view. Participates in downstream fusion without a
    /// copy.
    pub fn transpose(&mut self, arg: NodeId) -> Result<NodeId> {
        let s = &self.shapes[arg.0];
        if s.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: s.rank(),
            });
        }
        let shape = Shape::from((s.dims()[1], s.dims()[0]));
        Ok(self.push(Node::Transpose(arg), shape))
    }

    // Materialization

    /// Evaluate a node into a concrete tensor. Each reachable node is
    /// computed at most once per call, and elementwise chains run as
    /// single fused passes.
    pub fn eval(&self, root: NodeId) -> Result<Tensor<B>> {
        if self.leaves.is_empty() {
            return Err(Error::unsupported(
                "cannot evaluate a graph with no leaf tensors",
            ));
        }
        let dtype = self.leaves[0].dtype();
        let device = self.leaves[0].device().clone();
        for leaf in &self.leaves[1..] {
            if leaf.dtype() != dtype {
                return Err(Error::DTypeMismatch {
                    expected: dtype,
                    got: leaf.dtype(),
                });
            }
            if !leaf.device().same_device(&device) {
                return Err(Error::device(format!(
                    "graph leaves span devices {} and {}",
                    device.name(),
                    leaf.device().name()
                )));
            }
        }

        let plan = self.compile(root, dtype)?;

        let guards: Vec<_> = self.leaves.iter().map(|t| t.storage()).collect();
        let views: Vec<(&B::Storage, &Layout)> = guards
            .iter()
            .zip(self.leaves.iter())
            .map(|(g, t)| (&**g, t.layout()))
            .collect();

        let storage = B::run_plan(&plan, &views, &device)?;
        let shape = self.shapes[root.0].clone();
        Ok(Tensor::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device,
        ))
    }

    /// Compile the DAG reachable from `root` into a Plan.
    pub fn compile(&self, root: NodeId, dtype: DType) -> Result<Plan> {
        let mut c = Compiler {
            graph: self,
            use_count: vec![0; self.nodes.len()],
            slot_of: HashMap::new(),
            steps: Vec::new(),
            slot_shapes: Vec::new(),
        };
        c.count_uses(root);
        let root_slot = c.slot_for(root)?;
        Ok(Plan {
            steps: c.steps,
            slot_shapes: c.slot_shapes,
            root: root_slot,
            dtype,
        })
    }
}

// Plan — the compiled form a backend executes

/// Where a step input reads from: a graph leaf or a previously
/// materialized slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    Leaf(usize),
    Slot(usize),
}

/// A strided view over a leaf or slot. Transposition and broadcasting are
/// already folded into the layout.
#[derive(Debug, Clone)]
pub struct PlanView {
    pub source: ValueRef,
    pub layout: Layout,
}

/// Postfix instruction of a fused elementwise pass.
#[derive(Debug, Clone, Copy)]
pub enum MapInstr {
    /// Push input `i` (per-element load through its view).
    Input(usize),
    /// Push a constant.
    Const(f64),
    /// Pop two, push the result.
    Bin(BinOp),
}

/// One fused elementwise pass.
#[derive(Debug, Clone)]
pub struct MapStep {
    pub prog: Vec<MapInstr>,
    /// Inputs referenced by `MapInstr::Input`, with layouts broadcast to
    /// `out_shape`.
    pub inputs: Vec<PlanView>,
    pub out_shape: Shape,
    pub dst: usize,
}

/// A single execution step over value slots.
#[derive(Debug, Clone)]
pub enum Step {
    Map(MapStep),
    Reduce {
        op: ReduceOp,
        src: PlanView,
        axis: Option<usize>,
        out_shape: Shape,
        dst: usize,
    },
    Dot {
        lhs: PlanView,
        rhs: PlanView,
        out_shape: Shape,
        dst: usize,
    },
}

/// A compiled operation tree: steps in dependency order over `slot_shapes`
/// slots, with the result in `root`.
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub slot_shapes: Vec<Shape>,
    pub root: usize,
    pub dtype: DType,
}

impl Plan {
    /// Maximum value-stack depth any Map step needs.
    pub fn max_stack(&self) -> usize {
        let mut max = 1;
        for step in &self.steps {
            if let Step::Map(m) = step {
                let mut depth = 0usize;
                for instr in &m.prog {
                    match instr {
                        MapInstr::Input(_) | MapInstr::Const(_) => depth += 1,
                        MapInstr::Bin(_) => depth -= 1,
                    }
                    max = max.max(depth);
                }
            }
        }
        max
    }
}

struct Compiler<'g, B: Backend> {
    graph: &'g Graph<B>,
    use_count: Vec<usize>,
    slot_of: HashMap<usize, usize>,
    steps: Vec<Step>,
    slot_shapes: Vec<Shape>,
}

impl<'g, B: Backend> Compiler<'g, B> {
    /// Count consumer edges per node; a node with more than one becomes a
    /// materialization boundary so it is computed exactly once.
    fn count_uses(&mut self, id: NodeId) {
        let first_visit = self.use_count[id.0] == 0;
        self.use_count[id.0] += 1;
        if !first_visit {
            return;
        }
        match &self.graph.nodes[id.0] {
            Node::Leaf(_) | Node::Scalar(_) => {}
            Node::Binary { lhs, rhs, .. } | Node::Dot { lhs, rhs } => {
                self.count_uses(*lhs);
                self.count_uses(*rhs);
            }
            Node::Reduce { arg, .. } | Node::Transpose(arg) => self.count_uses(*arg),
        }
    }

    fn new_slot(&mut self, shape: Shape) -> usize {
        self.slot_shapes.push(shape);
        self.slot_shapes.len() - 1
    }

    /// Materialize a node into a slot, emitting whatever steps that takes.
    fn slot_for(&mut self, id: NodeId) -> Result<usize> {
        if let Some(&slot) = self.slot_of.get(&id.0) {
            return Ok(slot);
        }
        let out_shape = self.graph.shapes[id.0].clone();
        let slot = match self.graph.nodes[id.0].clone() {
            Node::Reduce { op, arg, axis, .. } => {
                let src = self.view_for(arg)?;
                let dst = self.new_slot(out_shape.clone());
                self.steps.push(Step::Reduce {
                    op,
                    src,
                    axis,
                    out_shape,
                    dst,
                });
                dst
            }
            Node::Dot { lhs, rhs } => {
                let lhs = self.view_for(lhs)?;
                let rhs = self.view_for(rhs)?;
                let dst = self.new_slot(out_shape.clone());
                self.steps.push(Step::Dot {
                    lhs,
                    rhs,
                    out_shape,
                    dst,
                });
                dst
            }
            // Everything else materializes through one fused Map over the
            // elementwise region rooted here.
            _ => {
                let mut prog = Vec::new();
                let mut inputs = Vec::new();
                self.emit_expr(id, id, &out_shape, &mut prog, &mut inputs)?;
                let dst = self.new_slot(out_shape.clone());
                self.steps.push(Step::Map(MapStep {
                    prog,
                    inputs,
                    out_shape,
                    dst,
                }));
                dst
            }
        };
        self.slot_of.insert(id.0, slot);
        Ok(slot)
    }

    /// A readable view of a node's value without new elementwise compute:
    /// leaves and transposes stay views; anything computed becomes a slot.
    fn view_for(&mut self, id: NodeId) -> Result<PlanView> {
        match self.graph.nodes[id.0].clone() {
            Node::Leaf(index) => Ok(PlanView {
                source: ValueRef::Leaf(index),
                layout: self.graph.leaves[index].layout().clone(),
            }),
            Node::Transpose(arg) => {
                let inner = self.view_for(arg)?;
                Ok(PlanView {
                    source: inner.source,
                    layout: inner.layout.transpose(0, 1)?,
                })
            }
            _ => {
                let slot = self.slot_for(id)?;
                Ok(PlanView {
                    source: ValueRef::Slot(slot),
                    layout: Layout::contiguous(self.graph.shapes[id.0].clone()),
                })
            }
        }
    }

    fn push_input(
        &mut self,
        view: PlanView,
        out_shape: &Shape,
        prog: &mut Vec<MapInstr>,
        inputs: &mut Vec<PlanView>,
    ) -> Result<()> {
        let layout = view.layout.broadcast_to(out_shape)?;
        inputs.push(PlanView {
            source: view.source,
            layout,
        });
        prog.push(MapInstr::Input(inputs.len() - 1));
        Ok(())
    }

    /// Emit postfix instructions computing `id` inside the fused region
    /// rooted at `region_root`. Shared subexpressions and reduce/dot
    /// results enter as materialized inputs; unshared elementwise nodes
    /// inline.
    fn emit_expr(
        &mut self,
        id: NodeId,
        region_root: NodeId,
        out_shape: &Shape,
        prog: &mut Vec<MapInstr>,
        inputs: &mut Vec<PlanView>,
    ) -> Result<()> {
        let node = self.graph.nodes[id.0].clone();
        let boundary = id != region_root
            && match &node {
                Node::Binary { .. } => self.use_count[id.0] > 1,
                Node::Reduce { .. } | Node::Dot { .. } => true,
                _ => false,
            };
        if boundary {
            let view = self.view_for(id)?;
            return self.push_input(view, out_shape, prog, inputs);
        }
        match node {
            Node::Leaf(_) | Node::Transpose(_) => {
                let view = self.view_for(id)?;
                self.push_input(view, out_shape, prog, inputs)
            }
            Node::Scalar(v) => {
                prog.push(MapInstr::Const(v));
                Ok(())
            }
            Node::Binary { op, lhs, rhs } => {
                self.emit_expr(lhs, region_root, out_shape, prog, inputs)?;
                self.emit_expr(rhs, region_root, out_shape, prog, inputs)?;
                prog.push(MapInstr::Bin(op));
                Ok(())
            }
            Node::Reduce { .. } | Node::Dot { .. } => {
                unreachable!("reduce/dot regions materialize via slot_for")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plan-level tests are backend-free: they only look at the compiled
    // structure. Numeric behavior is covered by the backend crates.

    #[derive(Clone, Debug)]
    struct NullBackend;

    #[derive(Clone, Debug)]
    struct NullDevice;

    impl BackendDevice for NullDevice {
        fn name(&self) -> String {
            "null".into()
        }
        fn synchronize(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct NullStorage(usize);

    impl crate::backend::BackendStorage for NullStorage {
        fn dtype(&self) -> DType {
            DType::F32
        }
        fn len(&self) -> usize {
            self.0
        }
    }

    impl Backend for NullBackend {
        type Device = NullDevice;
        type Storage = NullStorage;

        fn zeros(shape: &Shape, _: DType, _: &NullDevice) -> Result<NullStorage> {
            Ok(NullStorage(shape.elem_count()))
        }
        fn from_f64_slice(data: &[f64], _: DType, _: &NullDevice) -> Result<NullStorage> {
            Ok(NullStorage(data.len()))
        }
        fn to_f64_vec(s: &NullStorage, _: &Layout) -> Result<Vec<f64>> {
            Ok(vec![0.0; s.0])
        }
        fn fprop_conv(
            _: &crate::ConvLayer,
            _: &NullStorage,
            _: &NullStorage,
            _: &mut NullStorage,
            _: &NullDevice,
        ) -> Result<()> {
            unreachable!()
        }
        fn bprop_conv(
            _: &crate::ConvLayer,
            _: &NullStorage,
            _: &NullStorage,
            _: &mut NullStorage,
            _: &NullDevice,
        ) -> Result<()> {
            unreachable!()
        }
        fn update_conv(
            _: &crate::ConvLayer,
            _: &NullStorage,
            _: &NullStorage,
            _: &mut NullStorage,
            _: &NullDevice,
        ) -> Result<()> {
            unreachable!()
        }
        fn fprop_pool(
            _: &crate::PoolLayer,
            _: &NullStorage,
            _: &mut NullStorage,
            _: &NullDevice,
        ) -> Result<()> {
            unreachable!()
        }
        fn bprop_pool(
            _: &crate::PoolLayer,
            _: &NullStorage,
            _: &NullStorage,
            _: &mut NullStorage,
            _: &NullDevice,
        ) -> Result<()> {
            unreachable!()
        }
        fn run_plan(
            _: &Plan,
            _: &[(&NullStorage, &Layout)],
            _: &NullDevice,
        ) -> Result<NullStorage> {
            unreachable!()
        }
    }

    fn leaf_2x2(g: &mut Graph<NullBackend>) -> NodeId {
        let t = Tensor::<NullBackend>::zeros((2, 2), DType::F32, &NullDevice).unwrap();
        g.leaf(&t)
    }

    #[test]
    fn test_elementwise_chain_fuses_to_one_map() {
        let mut g = Graph::<NullBackend>::new();
        let a = leaf_2x2(&mut g);
        let b = leaf_2x2(&mut g);
        let c = g.scalar(2.0);
        let ab = g.add(a, b).unwrap();
        let abc = g.mul(ab, c).unwrap();
        let root = g.div(abc, b).unwrap();

        let plan = g.compile(root, DType::F32).unwrap();
        assert_eq!(plan.steps.len(), 1, "chain must fuse into a single pass");
        match &plan.steps[0] {
            Step::Map(m) => {
                // postfix: a b + 2.0 * b /
                assert_eq!(m.prog.len(), 7);
                assert_eq!(m.inputs.len(), 3);
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_subexpression_single_slot() {
        let mut g = Graph::<NullBackend>::new();
        let a = leaf_2x2(&mut g);
        let b = leaf_2x2(&mut g);
        let shared = g.add(a, b).unwrap();
        let lhs = g.mul(shared, a).unwrap();
        let root = g.add(lhs, shared).unwrap();

        let plan = g.compile(root, DType::F32).unwrap();
        // shared materializes once; the root map reads that slot twice.
        assert_eq!(plan.steps.len(), 2);
        match &plan.steps[1] {
            Step::Map(m) => {
                let slot_reads = m
                    .inputs
                    .iter()
                    .filter(|v| matches!(v.source, ValueRef::Slot(0)))
                    .count();
                assert_eq!(slot_reads, 2);
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn test_transpose_folds_into_view() {
        let mut g = Graph::<NullBackend>::new();
        let a = leaf_2x2(&mut g);
        let at = g.transpose(a).unwrap();
        let root = g.add(at, a).unwrap();

        let plan = g.compile(root, DType::F32).unwrap();
        assert_eq!(plan.steps.len(), 1, "transpose must not emit a step");
        match &plan.steps[0] {
            Step::Map(m) => {
                assert_eq!(m.inputs[0].layout.strides(), &[1, 2]);
                assert_eq!(m.inputs[1].layout.strides(), &[2, 1]);
            }
            other => panic!("expected Map, got {other:?}"),
        }
    }

    #[test]
    fn test_reduce_and_dot_are_boundaries() {
        let mut g = Graph::<NullBackend>::new();
        let a = leaf_2x2(&mut g);
        let b = leaf_2x2(&mut g);
        let s = g.sum(a, Some(0), true).unwrap();
        let d = g.dot(a, b).unwrap();
        let sb = g.add(s, d).unwrap();
        let root = g.mul(sb, b).unwrap();

        let plan = g.compile(root, DType::F32).unwrap();
        // reduce + dot + one fused map for (s + d) * b
        assert_eq!(plan.steps.len(), 3);
        assert!(matches!(plan.steps[0], Step::Reduce { .. }));
        assert!(matches!(plan.steps[1], Step::Dot { .. }));
        assert!(matches!(plan.steps[2], Step::Map(_)));
    }

    #[test]
    fn test_reduce_shapes() {
        let mut g = Graph::<NullBackend>::new();
        let a = leaf_2x2(&mut g);
        let all_keep = g.std(a, None, true).unwrap();
        assert_eq!(g.shape(all_keep).dims(), &[1, 1]);
        let ax0 = g.var(a, Some(0), true).unwrap();
        assert_eq!(g.shape(ax0).dims(), &[1, 2]);
        let ax1 = g.max(a, Some(1), false).unwrap();
        assert_eq!(g.shape(ax1).dims(), &[2]);
        assert!(g.sum(a, Some(2), true).is_err());
    }

    #[test]
    fn test_dot_shape_validation() {
        let mut g = Graph::<NullBackend>::new();
        let t1 = Tensor::<NullBackend>::zeros((2, 3), DType::F32, &NullDevice).unwrap();
        let t2 = Tensor::<NullBackend>::zeros((4, 2), DType::F32, &NullDevice).unwrap();
        let a = g.leaf(&t1);
        let b = g.leaf(&t2);
        assert!(g.dot(a, b).is_err());
        let bt = g.transpose(b).unwrap();
        assert!(g.dot(a, bt).is_ok());
    }
}
