// To debug or develop a test, try `eprintln!("{}", d.dump_chain())`

use std::collections::HashSet;

use findep::{
    AllocationGraph, Arc, Array, BinaryOp, BlockName, Callee, Dependency, EngineContext,
    Execution, Expr, ExprRef, FunctionName, GlobalName, Instruction, InstructionName, Operand,
    Options, UArc, UpdateList, Value, ValueRef,
};

// ------------------------------------------------------------------
// Helpers

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn context() -> Arc<EngineContext> {
    Arc::new(EngineContext::new(Options::default()))
}

fn block(function: &str, name: &str) -> UArc<BlockName> {
    let f = UArc::new(FunctionName::from(function));
    UArc::new(BlockName::new(f, name))
}

fn local(block: &UArc<BlockName>, idx: usize) -> ValueRef {
    UArc::new(Value::Instruction(UArc::new(InstructionName::new(
        block.function().clone(),
        block.clone(),
        idx,
    ))))
}

fn global(name: &str) -> ValueRef {
    UArc::new(Value::Global(GlobalName::from(name)))
}

fn constant(expr: &ExprRef) -> ValueRef {
    UArc::new(Value::Constant(expr.clone()))
}

fn committed(outcome: Execution) {
    assert!(outcome.is_committed());
}

// ------------------------------------------------------------------
// Straight-line arithmetic

#[test]
fn straight_line_arithmetic() {
    init_tracing();
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    // a = alloca
    let a = local(&b, 0);
    let addr = Expr::constant(0x1000, 64);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));

    // store 7, a
    let seven = Expr::constant(7, 64);
    let seven_v = constant(&seven);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(seven_v.clone()),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[seven.clone(), addr.clone()],
    ));

    // x = load a
    let x = local(&b, 2);
    committed(d.execute(
        &Instruction::load(x.clone(), Operand::Local(a.clone()), b.clone()).unwrap(),
        &[addr.clone()],
    ));

    // y = x + 3
    let y = local(&b, 3);
    let three = Expr::constant(3, 64);
    committed(d.execute(
        &Instruction::binary(
            y.clone(),
            BinaryOp::Add,
            Operand::Local(x.clone()),
            Operand::Constant(constant(&three)),
            b.clone(),
        )
        .unwrap(),
        &[seven.clone(), three],
    ));

    // y transitively depends on the loaded x.
    let vy = d.latest_value_no_constant_check(&y).unwrap();
    let sources = d.all_flow_sources(&vy);
    assert!(sources.iter().any(|s| s.has_value(&x)));
    // The loaded x depends on the stored constant.
    assert!(sources.iter().any(|s| s.has_value(&seven_v)));

    // The alloca result is pointer-equal to its allocation.
    let va = d.latest_value_no_constant_check(&a).unwrap();
    assert!(d.resolve_allocation(&va).is_some());

    // The store landed at the concrete address.
    let mut replacements = HashSet::new();
    let (concrete, symbolic) = d.get_stored_expressions(&mut replacements, false);
    let slots = concrete.get(&a).expect("concrete entry for the alloca site");
    let (slot_addr, slot_value) = slots.get(&0x1000).expect("slot at the alloca address");
    assert_eq!(slot_addr.as_constant(), Some(0x1000));
    assert_eq!(slot_value.as_constant(), Some(7));
    assert!(symbolic.get(&a).is_none());
}

#[test]
fn core_marking_selects_the_mediating_allocation() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    let a = local(&b, 0);
    let addr = Expr::constant(0x1000, 64);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));
    let seven = Expr::constant(7, 64);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(constant(&seven)),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[seven.clone(), addr.clone()],
    ));
    let x = local(&b, 2);
    committed(d.execute(
        &Instruction::load(x.clone(), Operand::Local(a.clone()), b.clone()).unwrap(),
        &[addr.clone()],
    ));
    let y = local(&b, 3);
    let three = Expr::constant(3, 64);
    committed(d.execute(
        &Instruction::binary(
            y.clone(),
            BinaryOp::Add,
            Operand::Local(x.clone()),
            Operand::Constant(constant(&three)),
            b.clone(),
        )
        .unwrap(),
        &[seven, three],
    ));

    let mut g = AllocationGraph::new();
    d.mark_all_values_of(&mut g, &y);
    d.compute_core_allocations(&mut g);
    let core = d.core_allocations();
    assert_eq!(core.len(), 1);
    assert!(core[0].is_core());

    let mut replacements = HashSet::new();
    let (concrete, _symbolic) = d.get_stored_expressions(&mut replacements, true);
    let slots = concrete.get(&a).expect("core export keeps the store");
    assert_eq!(slots.get(&0x1000).unwrap().1.as_constant(), Some(7));
}

// ------------------------------------------------------------------
// Pointer indirection

fn two_cells(
    d: &mut Dependency,
    b: &UArc<BlockName>,
) -> (ValueRef, ValueRef, ExprRef, ExprRef) {
    let p = local(b, 0);
    let q = local(b, 1);
    let addr_p = Expr::constant(0x2000, 64);
    let addr_q = Expr::constant(0x2008, 64);
    committed(d.execute(&Instruction::alloca(p.clone(), b.clone()).unwrap(), &[addr_p.clone()]));
    committed(d.execute(&Instruction::alloca(q.clone(), b.clone()).unwrap(), &[addr_q.clone()]));
    (p, q, addr_p, addr_q)
}

#[test]
fn pointer_indirection_reaches_the_stored_constant() {
    init_tracing();
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");
    let (p, q, addr_p, addr_q) = two_cells(&mut d, &b);

    // store 7, p
    let seven = Expr::constant(7, 64);
    let seven_v = constant(&seven);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(seven_v.clone()),
            Operand::Local(p.clone()),
            b.clone(),
        )
        .unwrap(),
        &[seven, addr_p.clone()],
    ));
    // store p, q
    committed(d.execute(
        &Instruction::store(Operand::Local(p.clone()), Operand::Local(q.clone()), b.clone())
            .unwrap(),
        &[addr_p.clone(), addr_q.clone()],
    ));
    // r = load q
    let r = local(&b, 4);
    committed(d.execute(
        &Instruction::load(r.clone(), Operand::Local(q.clone()), b.clone()).unwrap(),
        &[addr_q],
    ));
    // s = load r
    let s = local(&b, 5);
    committed(d.execute(
        &Instruction::load(s.clone(), Operand::Local(r.clone()), b.clone()).unwrap(),
        &[addr_p],
    ));

    let vs = d.latest_value_no_constant_check(&s).unwrap();
    let sources = d.all_flow_sources(&vs);
    assert!(sources.iter().any(|v| v.has_value(&seven_v)));
}

#[test]
fn loading_an_uninitialized_cell_is_an_unknown_load() {
    let ctx = context();
    let mut d = Dependency::new(ctx.clone(), None);
    let b = block("main", "entry");
    let (p, q, addr_p, addr_q) = two_cells(&mut d, &b);

    // store p, q; r = load q; s = load r, with p never written.
    committed(d.execute(
        &Instruction::store(Operand::Local(p.clone()), Operand::Local(q.clone()), b.clone())
            .unwrap(),
        &[addr_p.clone(), addr_q.clone()],
    ));
    let r = local(&b, 4);
    committed(d.execute(
        &Instruction::load(r.clone(), Operand::Local(q.clone()), b.clone()).unwrap(),
        &[addr_q],
    ));
    let s = local(&b, 5);
    committed(d.execute(
        &Instruction::load(s.clone(), Operand::Local(r.clone()), b.clone()).unwrap(),
        &[addr_p],
    ));

    // The result was deposited at the unknown location.
    let unknown = d
        .stored_values(ctx.unknown_allocation())
        .into_iter()
        .any(|v| v.has_value(&s));
    assert!(unknown);
}

#[test]
fn loads_through_a_gep_rediscover_the_allocation() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    let a = local(&b, 0);
    let addr = Expr::constant(0x2800, 64);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));
    let seven = Expr::constant(7, 64);
    let seven_v = constant(&seven);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(seven_v.clone()),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[seven, addr.clone()],
    ));

    // g = getelementptr a, 1
    let g = local(&b, 2);
    let one = Expr::constant(1, 64);
    committed(d.execute(
        &Instruction::getelementptr(
            g.clone(),
            Operand::Local(a.clone()),
            vec![Operand::Constant(constant(&one))],
            b.clone(),
        )
        .unwrap(),
        &[addr, one],
    ));

    // x = load g finds the allocation through the gep edge.
    let x = local(&b, 3);
    committed(d.execute(
        &Instruction::load(x.clone(), Operand::Local(g.clone()), b).unwrap(),
        &[Expr::constant(0x2808, 64)],
    ));
    let vx = d.latest_value_no_constant_check(&x).unwrap();
    let sources = d.all_flow_sources(&vx);
    assert!(sources.iter().any(|v| v.has_value(&seven_v)));

    // Closure terminals have no incoming edges of their own.
    let ends = d.all_flow_sources_ends(&vx);
    assert!(ends.iter().any(|v| v.has_value(&seven_v)));
    for end in &ends {
        assert!(d.direct_flow_sources(end).is_empty());
    }
}

// ------------------------------------------------------------------
// Destructive overwrite

#[test]
fn destructive_overwrite_versions_the_allocation() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    let a = local(&b, 0);
    let addr = Expr::constant(0x3000, 64);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));

    let one = Expr::constant(1, 64);
    let two = Expr::constant(2, 64);
    let two_v = constant(&two);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(constant(&one)),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[one, addr.clone()],
    ));
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(two_v.clone()),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[two, addr.clone()],
    ));

    // Only the latest version is visible to a load.
    let x = local(&b, 3);
    committed(d.execute(
        &Instruction::load(x.clone(), Operand::Local(a.clone()), b.clone()).unwrap(),
        &[addr],
    ));
    let vx = d.latest_value_no_constant_check(&x).unwrap();
    let sources = d.all_flow_sources(&vx);
    assert_eq!(sources.len(), 1);
    assert!(sources[0].has_value(&two_v));

    // Core-marking the overwriting value claims only its version.
    let mut g = AllocationGraph::new();
    d.mark_all_values_of(&mut g, &two_v);
    d.compute_core_allocations(&mut g);
    assert_eq!(d.core_allocations().len(), 1);

    let mut replacements = HashSet::new();
    let (concrete, _) = d.get_stored_expressions(&mut replacements, true);
    let slots = concrete.get(&a).expect("overwriting store survives");
    assert_eq!(slots.get(&0x3000).unwrap().1.as_constant(), Some(2));
}

#[test]
fn storing_through_a_loaded_value_targets_an_indirect_location() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    // q holds a plain value; x = load q; store 5 through x. The target is
    // only known to be one load away from q.
    let q = local(&b, 0);
    let addr_q = Expr::constant(0x2008, 64);
    committed(d.execute(&Instruction::alloca(q.clone(), b.clone()).unwrap(), &[addr_q.clone()]));
    let one = Expr::constant(1, 64);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(constant(&one)),
            Operand::Local(q.clone()),
            b.clone(),
        )
        .unwrap(),
        &[one.clone(), addr_q.clone()],
    ));
    let x = local(&b, 2);
    committed(d.execute(
        &Instruction::load(x.clone(), Operand::Local(q.clone()), b.clone()).unwrap(),
        &[addr_q.clone()],
    ));
    let five = Expr::constant(5, 64);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(constant(&five)),
            Operand::Local(x),
            b,
        )
        .unwrap(),
        &[five, one],
    ));

    // The indirect deposit lands under the base site at a symbolic
    // address; the base cell's own slot is untouched.
    let mut replacements = HashSet::new();
    let (concrete, symbolic) = d.get_stored_expressions(&mut replacements, false);
    let slots = concrete.get(&q).expect("entry under the base site");
    assert_eq!(slots.get(&0x2008).unwrap().1.as_constant(), Some(1));
    let pairs = symbolic.get(&q).expect("indirect entry under the base site");
    assert_eq!(pairs.len(), 1);
    assert!(pairs[0].0.as_constant().is_none());
    assert_eq!(pairs[0].1.as_constant(), Some(5));
}

// ------------------------------------------------------------------
// Phi resolution

#[test]
fn phi_with_known_incoming_block_takes_one_edge() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b_then = block("f", "then");
    let b_else = block("f", "else");
    let b_join = block("f", "join");

    // x is defined in the `then` block, which also sets the incoming block.
    let x = local(&b_then, 0);
    let c = Expr::constant(11, 64);
    committed(d.execute(
        &Instruction::unary(x.clone(), Operand::Constant(constant(&c)), b_then.clone()).unwrap(),
        &[c.clone()],
    ));

    let nine = Expr::constant(9, 64);
    let v = local(&b_join, 0);
    committed(d.execute(
        &Instruction::phi(
            v.clone(),
            vec![
                (Operand::Local(x.clone()), b_then),
                (Operand::Constant(constant(&nine)), b_else),
            ],
            b_join,
        )
        .unwrap(),
        &[c, nine],
    ));

    let vphi = d.latest_value_no_constant_check(&v).unwrap();
    let sources = d.direct_flow_sources(&vphi);
    assert_eq!(sources.len(), 1);
    assert!(sources[0].has_value(&x));
}

#[test]
fn phi_with_unknown_incoming_block_is_conservative() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b_then = block("f", "then");
    let b_else = block("f", "else");
    let b_join = block("f", "join");

    let one = Expr::constant(1, 64);
    let two = Expr::constant(2, 64);
    let v = local(&b_join, 0);
    committed(d.execute(
        &Instruction::phi(
            v.clone(),
            vec![
                (Operand::Constant(constant(&one)), b_then),
                (Operand::Constant(constant(&two)), b_else),
            ],
            b_join,
        )
        .unwrap(),
        &[one, two],
    ));

    let vphi = d.latest_value_no_constant_check(&v).unwrap();
    assert_eq!(d.direct_flow_sources(&vphi).len(), 2);
}

// ------------------------------------------------------------------
// Environment

#[test]
fn store_to_the_environment_is_a_no_op() {
    init_tracing();
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");
    let environ = global("_environ");

    let x = Expr::constant(5, 64);
    let outcome = d.execute(
        &Instruction::store(
            Operand::Constant(constant(&x)),
            Operand::Local(environ),
            b,
        )
        .unwrap(),
        &[x, Expr::constant(0x4000, 64)],
    );
    assert_eq!(outcome, Execution::AbortedEnvironmentStore);

    let mut replacements = HashSet::new();
    let (concrete, symbolic) = d.get_stored_expressions(&mut replacements, false);
    assert!(concrete.is_empty());
    assert!(symbolic.is_empty());
}

#[test]
fn store_through_an_environment_pointer_aborts() {
    let ctx = context();
    let mut d = Dependency::new(ctx.clone(), None);
    let b = block("main", "entry");
    let environ = global("environ");

    // p = load @environ
    let p = local(&b, 0);
    committed(d.execute(
        &Instruction::load(p.clone(), Operand::Local(environ), b.clone()).unwrap(),
        &[Expr::constant(0x4000, 64)],
    ));
    let vp = d.latest_value_no_constant_check(&p).unwrap();
    assert_eq!(
        d.resolve_allocation(&vp).as_ref(),
        Some(ctx.unknown_environment_allocation())
    );

    // store 5 through p
    let five = Expr::constant(5, 64);
    let outcome = d.execute(
        &Instruction::store(
            Operand::Constant(constant(&five)),
            Operand::Local(p),
            b,
        )
        .unwrap(),
        &[five, Expr::constant(0x4008, 64)],
    );
    assert_eq!(outcome, Execution::AbortedEnvironmentStore);
}

// ------------------------------------------------------------------
// Calls and returns

#[test]
fn arguments_flow_into_parameters_and_back() {
    let ctx = context();
    let b_caller = block("main", "entry");
    let b_callee = block("f", "entry");

    let mut caller = Dependency::new(ctx.clone(), None);
    let x = local(&b_caller, 0);
    let c = Expr::constant(21, 64);
    committed(caller.execute(
        &Instruction::unary(x.clone(), Operand::Constant(constant(&c)), b_caller.clone())
            .unwrap(),
        &[c.clone()],
    ));

    // res = call @f(x)
    let res = local(&b_caller, 1);
    let call = Instruction::call(
        Some(res.clone()),
        Callee::Operand(Operand::Local(global("f"))),
        vec![Operand::Local(x.clone())],
        b_caller,
    )
    .unwrap();
    committed(caller.execute(&call, &[c.clone()]));

    // The callee runs in a child node and claims the pending arguments.
    let caller = Arc::new(caller);
    let mut callee = Dependency::new(ctx, Some(caller));
    let param = UArc::new(Value::Parameter(findep::ParameterName::new(
        b_callee.function().clone(),
        "a",
    )));
    callee.bind_callee_parameters(&[(param.clone(), c.clone())]);
    let vparam = callee.latest_value_no_constant_check(&param).unwrap();
    assert!(callee.all_flow_sources(&vparam).iter().any(|v| v.has_value(&x)));

    // ret a
    let ret = Instruction::ret(Some(Operand::Local(param)), b_callee).unwrap();
    callee.bind_return_value(&call, &ret, c);
    let vres = callee.latest_value_no_constant_check(&res).unwrap();
    let sources = callee.all_flow_sources(&vres);
    assert!(sources.iter().any(|v| v.has_value(&x)));
}

// ------------------------------------------------------------------
// Interpolant export

#[test]
fn core_export_renames_arrays_through_shadows() {
    init_tracing();
    let ctx = context();
    let mut d = Dependency::new(ctx.clone(), None);
    let b = block("main", "entry");

    let arr = UArc::new(Array::new("arr", 8));
    let value_expr = Expr::read(
        UpdateList::new(arr.clone(), None),
        Expr::constant(3, 32),
    );
    let value_ref = constant(&value_expr);

    let a = local(&b, 0);
    let addr = Expr::constant(0xDEAD, 64);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(value_ref.clone()),
            Operand::Local(a.clone()),
            b,
        )
        .unwrap(),
        &[value_expr, addr],
    ));

    let mut g = AllocationGraph::new();
    d.mark_all_values_of(&mut g, &value_ref);
    d.compute_core_allocations(&mut g);

    let mut replacements = HashSet::new();
    let (concrete, symbolic) = d.get_stored_expressions(&mut replacements, true);
    assert!(replacements.contains(&arr));

    let slots = concrete.get(&a).expect("core export keeps the store");
    let (slot_addr, slot_value) = slots.get(&0xDEAD).expect("slot at the constant address");
    assert_eq!(slot_addr.as_constant(), Some(0xDEAD));

    let shadow = ctx.shadow().shadow_of(&arr).expect("shadow registered");
    assert_eq!(shadow.name(), "__shadow__arr");
    let expected = Expr::read(
        UpdateList::new(shadow, None),
        Expr::constant(3, 32),
    );
    assert_eq!(slot_value, &expected);

    assert!(symbolic.get(&a).is_none());
}

#[test]
fn symbolic_addresses_export_to_the_symbolic_store() {
    let ctx = context();
    let mut d = Dependency::new(ctx, None);
    let b = block("main", "entry");

    let base = UArc::new(Array::new("base", 8));
    let addr = Expr::read(UpdateList::new(base, None), Expr::constant(0, 32));
    let a = local(&b, 0);
    committed(d.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));
    let five = Expr::constant(5, 64);
    committed(d.execute(
        &Instruction::store(
            Operand::Constant(constant(&five)),
            Operand::Local(a.clone()),
            b,
        )
        .unwrap(),
        &[five, addr],
    ));

    let mut replacements = HashSet::new();
    let (concrete, symbolic) = d.get_stored_expressions(&mut replacements, false);
    assert!(concrete.get(&a).is_none());
    let pairs = symbolic.get(&a).expect("symbolic entry for the alloca site");
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].1.as_constant(), Some(5));
}

// ------------------------------------------------------------------
// Chains

#[test]
fn child_nodes_see_ancestor_relations() {
    let ctx = context();
    let b = block("main", "entry");

    let mut parent = Dependency::new(ctx.clone(), None);
    let a = local(&b, 0);
    let addr = Expr::constant(0x5000, 64);
    committed(parent.execute(&Instruction::alloca(a.clone(), b.clone()).unwrap(), &[addr.clone()]));
    let seven = Expr::constant(7, 64);
    committed(parent.execute(
        &Instruction::store(
            Operand::Constant(constant(&seven)),
            Operand::Local(a.clone()),
            b.clone(),
        )
        .unwrap(),
        &[seven, addr.clone()],
    ));

    let parent = Arc::new(parent);
    let mut child = Dependency::new(ctx, Some(parent.clone()));
    let x = local(&b, 2);
    committed(child.execute(
        &Instruction::load(x.clone(), Operand::Local(a.clone()), b).unwrap(),
        &[addr],
    ));

    // The child's load found the parent's store.
    let vx = child.latest_value_no_constant_check(&x).unwrap();
    assert_eq!(child.all_flow_sources(&vx).len(), 1);
    // The flow edge lives in the child; the parent's closure is unchanged.
    assert!(parent.latest_value_no_constant_check(&x).is_none());

    // The export walks the whole chain.
    let mut replacements = HashSet::new();
    let (concrete, _) = child.get_stored_expressions(&mut replacements, false);
    assert!(concrete.contains_key(&a));
}
