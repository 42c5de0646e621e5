// Integration tests for variables, naming scopes and stateless execution
//
// Everything here runs on the calling thread's scope stack, the way user
// code does. Each test runs on its own thread, so stacks never leak between
// tests.

use stoat::prelude::*;
use stoat::{initialize_all_variables, CallerId};

fn w_2x2() -> stoat::Result<Variable> {
    Variable::builder(Tensor::zeros((2, 2), DType::F32))
        .name("w")
        .build()
}

// Basic lifecycle

#[test]
fn test_create_then_read() -> stoat::Result<()> {
    let v = Variable::builder(init::glorot_uniform(Some(1)))
        .shape((3, 5))
        .dtype(DType::F64)
        .name("kernel")
        .build()?;
    let value = v.read()?;
    assert_eq!(value.dims(), &[3, 5]);
    assert_eq!(value.dtype(), DType::F64);
    assert_eq!(v.path(), "kernel");
    assert!(v.trainable());
    Ok(())
}

#[test]
fn test_w_assign_scenario() -> stoat::Result<()> {
    let w = w_2x2()?;
    let ones = Tensor::ones((2, 2), DType::F32);
    w.assign(&ones)?;
    assert!(w.read()?.allclose(&ones, 0.0));

    let err = w.assign(&Tensor::ones((3, 3), DType::F32)).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert!(w.read()?.allclose(&ones, 0.0));
    Ok(())
}

#[test]
fn test_w_stateless_scenario() -> stoat::Result<()> {
    let w = w_2x2()?;
    let x = Tensor::full((2, 2), 2.0, DType::F32);
    let y = Tensor::full((2, 2), 3.0, DType::F32);

    let guard = StatelessScope::new().with_override(&w, x.clone())?.enter()?;
    assert!(w.read()?.allclose(&x, 0.0));
    w.assign(&y)?;
    assert!(w.read()?.allclose(&y, 0.0));
    let scope = guard.exit()?;

    assert!(scope.updated_value(&w).unwrap().allclose(&y, 0.0));
    assert!(w.read()?.allclose(&Tensor::zeros((2, 2), DType::F32), 0.0));
    Ok(())
}

#[test]
fn test_pending_p_scenario() -> stoat::Result<()> {
    let guard = StatelessScope::new().enter()?;
    let p = Variable::builder(init::ones())
        .shape(3)
        .name("p")
        .build()?;
    let inside = p.read()?;
    assert_eq!(inside.to_f64_vec(), vec![1.0; 3]);
    let scope = guard.exit()?;

    assert!(scope.is_pending(&p));
    assert!(!p.is_initialized());
    initialize_all_variables()?;
    assert!(p.is_initialized());
    assert_eq!(p.read()?.to_f64_vec(), vec![1.0; 3]);
    Ok(())
}

#[test]
fn test_second_stateless_scope_rejected() -> stoat::Result<()> {
    let _outer = StatelessScope::new().enter()?;
    let err = StatelessScope::new().enter().unwrap_err();
    assert!(matches!(err, Error::NestedScope { .. }));
    Ok(())
}

#[test]
fn test_stateless_scope_released_on_error() -> stoat::Result<()> {
    let w = w_2x2()?;
    let run = || -> stoat::Result<()> {
        let _guard = StatelessScope::new().enter()?;
        w.assign(&Tensor::ones((2, 2), DType::F32))?;
        w.assign(&Tensor::ones(7, DType::F32))
    };
    assert!(run().is_err());
    assert!(!stoat::in_stateless_scope());
    assert_eq!(w.read()?.to_f64_vec(), vec![0.0; 4]);
    Ok(())
}

// Naming

#[test]
fn test_nested_name_scopes() -> stoat::Result<()> {
    let _a = name_scope("a")?;
    let _b = name_scope("b")?;
    assert_eq!(stoat::current_path(), "a/b");
    let v = Variable::builder(init::zeros())
        .shape(1)
        .name("bias")
        .build()?;
    assert_eq!(v.path(), "a/b/bias");
    Ok(())
}

#[test]
fn test_reentered_scope_deduplicates() -> stoat::Result<()> {
    let caller = CallerId::new();
    let _outer = name_scope(NameScope::new("a").with_caller(caller))?;
    let _inner = name_scope(NameScope::new("a").with_caller(caller))?;
    assert_eq!(stoat::current_path(), "a");
    Ok(())
}

#[test]
fn test_with_name_scope_releases_on_error() {
    let result: stoat::Result<()> = stoat::with_name_scope("block", || {
        assert_eq!(stoat::current_path(), "block");
        Err(Error::msg("fail"))
    });
    assert!(result.is_err());
    assert_eq!(stoat::current_path(), "");
}

// Autocast and symbolic scopes

#[test]
fn test_autocast_scope_changes_reads_not_storage() -> stoat::Result<()> {
    let v = Variable::builder(Tensor::full(4, 1.0 / 3.0, DType::F32))
        .name("x")
        .build()?;
    {
        let _g = autocast_scope(DType::BF16)?;
        let value = v.read()?;
        assert_eq!(value.dtype(), DType::BF16);
        assert_eq!(
            value.to_f64_vec()[0],
            DType::BF16.quantize(DType::F32.quantize(1.0 / 3.0))
        );
    }
    assert_eq!(v.read()?.dtype(), DType::F32);
    Ok(())
}

#[test]
fn test_symbolic_scope_builds_specs() -> stoat::Result<()> {
    let kernel = Variable::builder(init::zeros())
        .shape((3, 4))
        .name("kernel")
        .build()?;
    let _g = symbolic_scope()?;
    let x = SymbolicTensor::try_from_dims(&[None, Some(3)], DType::F32)?;
    let y = ops::matmul(x, Operand::try_from(&kernel)?)?;
    let spec = y.into_symbolic();
    assert_eq!(spec.shape().to_string(), "[?, 4]");
    assert!(kernel.is_pending());
    Ok(())
}

#[test]
fn test_negative_dims_rejected() {
    let err = SymbolicTensor::try_from_dims(&[Some(-1), Some(2)], DType::F32).unwrap_err();
    assert!(matches!(err, Error::Shape(_)));
}
