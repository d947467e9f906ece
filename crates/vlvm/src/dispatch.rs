//! The fetch-decode-execute loop: one opcode per [`step`], and the
//! step-bounded [`run`] loop built on top of it.

use vlcore::Value;

use crate::context::Context;
use crate::error::Error;
use crate::opcode::Opcode;

/// What happened during a single [`step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continued,
    Halted,
}

/// What stopped a [`run`] loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Halted,
    StepLimitReached,
}

/// Reads the `u32` operand at `*ip`, advancing it past the 4 bytes on
/// success. On truncation, records a `BadBytecode` error naming `opname` and
/// `op_ip` (the opcode's own address, for diagnostics).
fn read_u32(ctx: &mut Context, ip: &mut usize, op_ip: usize, opname: &str) -> Result<u32, Error> {
    let word: Option<[u8; 4]> = ctx.code_slice(*ip, 4).map(|b| b.try_into().unwrap());
    match word {
        Some(bytes) => {
            *ip += 4;
            Ok(u32::from_le_bytes(bytes))
        }
        None => Err(ctx.set_err(
            Error::BadBytecode,
            format!("truncated {opname} operand at ip {op_ip}"),
        )),
    }
}

fn read_u8(ctx: &mut Context, ip: &mut usize, op_ip: usize, opname: &str) -> Result<u8, Error> {
    match ctx.code_byte(*ip) {
        Some(b) => {
            *ip += 1;
            Ok(b)
        }
        None => Err(ctx.set_err(
            Error::BadBytecode,
            format!("truncated {opname} operand at ip {op_ip}"),
        )),
    }
}

fn read_i64(ctx: &mut Context, ip: &mut usize, op_ip: usize, opname: &str) -> Result<i64, Error> {
    let word: Option<[u8; 8]> = ctx.code_slice(*ip, 8).map(|b| b.try_into().unwrap());
    match word {
        Some(bytes) => {
            *ip += 8;
            Ok(i64::from_le_bytes(bytes))
        }
        None => Err(ctx.set_err(
            Error::BadBytecode,
            format!("truncated {opname} operand at ip {op_ip}"),
        )),
    }
}

fn read_f64(ctx: &mut Context, ip: &mut usize, op_ip: usize, opname: &str) -> Result<f64, Error> {
    let word: Option<[u8; 8]> = ctx.code_slice(*ip, 8).map(|b| b.try_into().unwrap());
    match word {
        Some(bytes) => {
            *ip += 8;
            Ok(f64::from_bits(u64::from_le_bytes(bytes)))
        }
        None => Err(ctx.set_err(
            Error::BadBytecode,
            format!("truncated {opname} operand at ip {op_ip}"),
        )),
    }
}

/// Fetches a constant-pool string by index, or fails `BadBytecode` citing
/// the bad index.
fn const_str(ctx: &mut Context, idx: u32, op_ip: usize) -> Result<vlcore::VlStr, Error> {
    ctx.const_str(idx)
        .ok_or_else(|| ctx.set_err(Error::BadBytecode, format!("bad constant index {idx} at ip {op_ip}")))
}

/// Pops the top two values, bottom-first: `(a, b)` where `b` was on top.
/// Underflow is absorbed by `pop`'s own defensive-Nil behaviour, which the
/// arithmetic/comparison type checks below then reject as non-numeric.
fn pop2(ctx: &mut Context) -> (Value, Value) {
    let b = ctx.pop();
    let a = ctx.pop();
    (a, b)
}

/// Executes exactly one instruction starting at the context's current `ip`.
pub fn step(ctx: &mut Context) -> Result<StepOutcome, Error> {
    let op_ip = ctx.ip();
    let op_byte = match ctx.code_byte(op_ip) {
        Some(b) => b,
        None => return Err(ctx.set_err(Error::BadBytecode, format!("ip {op_ip} past end of code"))),
    };
    let opcode = match Opcode::from_u8(op_byte) {
        Some(op) => op,
        None => {
            return Err(ctx.set_err(
                Error::BadBytecode,
                format!("unknown opcode {op_byte} at ip {op_ip}"),
            ))
        }
    };
    let mut ip = op_ip + 1;

    match opcode {
        Opcode::Nop => {}

        Opcode::PushI => {
            let n = read_i64(ctx, &mut ip, op_ip, "PushI")?;
            ctx.set_ip(ip);
            ctx.push(Value::Int(n))?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::PushF => {
            let f = read_f64(ctx, &mut ip, op_ip, "PushF")?;
            ctx.set_ip(ip);
            ctx.push(Value::Float(f))?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::PushS => {
            let idx = read_u32(ctx, &mut ip, op_ip, "PushS")?;
            let s = const_str(ctx, idx, op_ip)?;
            ctx.set_ip(ip);
            ctx.push(Value::Str(s))?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
            ctx.set_ip(ip);
            let (a, b) = pop2(ctx);
            let (name, (af, bf)) = match (opcode, a.as_f64(), b.as_f64()) {
                (_, Some(af), Some(bf)) => (arith_name(opcode), (af, bf)),
                _ => {
                    return Err(ctx.set_err(
                        Error::Runtime,
                        format!(
                            "{} requires numeric operands, got {} and {}",
                            arith_name(opcode),
                            a.type_name(),
                            b.type_name()
                        ),
                    ))
                }
            };
            let result = match opcode {
                Opcode::Add => af + bf,
                Opcode::Sub => af - bf,
                Opcode::Mul => af * bf,
                Opcode::Div => {
                    if bf == 0.0 {
                        return Err(ctx.set_err(Error::Runtime, format!("{name}: division by zero")));
                    }
                    af / bf
                }
                _ => unreachable!(),
            };
            ctx.push(Value::Float(result))?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
            ctx.set_ip(ip);
            let (a, b) = pop2(ctx);
            let result = compare(ctx, opcode, &a, &b)?;
            ctx.push(Value::Bool(result))?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::Print => {
            ctx.set_ip(ip);
            let v = ctx.pop();
            let mut text = v.display_canonical();
            text.push('\n');
            ctx.emit_output(&text);
            return Ok(StepOutcome::Continued);
        }

        Opcode::Pop => {
            ctx.set_ip(ip);
            ctx.pop();
            return Ok(StepOutcome::Continued);
        }

        Opcode::StoreG => {
            let idx = read_u32(ctx, &mut ip, op_ip, "StoreG")?;
            let name = const_str(ctx, idx, op_ip)?;
            ctx.set_ip(ip);
            let value = ctx.pop();
            ctx.set_global_by_const(&name, value)?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::LoadG => {
            let idx = read_u32(ctx, &mut ip, op_ip, "LoadG")?;
            let name = const_str(ctx, idx, op_ip)?;
            ctx.set_ip(ip);
            let value = ctx.get_global_by_const(&name).unwrap_or(Value::Nil);
            ctx.push(value)?;
            return Ok(StepOutcome::Continued);
        }

        Opcode::CallN => {
            let idx = read_u32(ctx, &mut ip, op_ip, "CallN")?;
            let argc = read_u8(ctx, &mut ip, op_ip, "CallN")?;
            let name = const_str(ctx, idx, op_ip)?;
            ctx.set_ip(ip);
            let argc = argc as usize;
            // Resolve the native before checking argc: an unregistered name
            // fails `NotFound` even when the stack is also under-supplied.
            let record = ctx.resolve_native(&name)?;
            if argc > ctx.stack_len() {
                return Err(ctx.set_err(
                    Error::Runtime,
                    format!("CallN argc {argc} exceeds stack depth {}", ctx.stack_len()),
                ));
            }
            let args: Vec<Value> = ctx
                .take_top(argc)
                .expect("argc already checked against stack depth");
            let result = ctx.invoke_native(record, &name, &args);
            match result {
                Ok(v) => ctx.push(v)?,
                Err(code) => return Err(code),
            }
            return Ok(StepOutcome::Continued);
        }

        Opcode::Halt => {
            ctx.set_ip(ip);
            return Ok(StepOutcome::Halted);
        }
    }

    ctx.set_ip(ip);
    Ok(StepOutcome::Continued)
}

fn arith_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "Add",
        Opcode::Sub => "Sub",
        Opcode::Mul => "Mul",
        Opcode::Div => "Div",
        _ => unreachable!(),
    }
}

/// Comparison semantics: numeric/numeric promotes to float; `Str`/`Str` is
/// only defined under `Eq`/`Neq`; every other combination is a `Runtime`
/// error.
fn compare(ctx: &mut Context, opcode: Opcode, a: &Value, b: &Value) -> Result<bool, Error> {
    if let (Some(af), Some(bf)) = (a.as_f64(), b.as_f64()) {
        return Ok(match opcode {
            Opcode::Eq => af == bf,
            Opcode::Neq => af != bf,
            Opcode::Lt => af < bf,
            Opcode::Gt => af > bf,
            Opcode::Le => af <= bf,
            Opcode::Ge => af >= bf,
            _ => unreachable!(),
        });
    }
    if let (Value::Str(sa), Value::Str(sb)) = (a, b) {
        return match opcode {
            Opcode::Eq => Ok(sa == sb),
            Opcode::Neq => Ok(sa != sb),
            _ => Err(ctx.set_err(
                Error::Runtime,
                "ordering comparisons are not defined for str operands".to_string(),
            )),
        };
    }
    Err(ctx.set_err(
        Error::Runtime,
        format!(
            "comparison requires matching numeric or str operands, got {} and {}",
            a.type_name(),
            b.type_name()
        ),
    ))
}

/// Repeatedly steps until `Halt`, an error, or `max_steps` instructions have
/// executed (`0` means unbounded).
pub fn run(ctx: &mut Context, max_steps: usize) -> Result<RunOutcome, Error> {
    let mut executed = 0usize;
    loop {
        if max_steps != 0 && executed == max_steps {
            return Ok(RunOutcome::StepLimitReached);
        }
        match step(ctx)? {
            StepOutcome::Halted => return Ok(RunOutcome::Halted),
            StepOutcome::Continued => {}
        }
        executed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextConfig;
    use crate::image::encode_image;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn hello_then_arithmetic() {
        let mut code = Vec::new();
        code.push(Opcode::PushS.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Opcode::CallN.as_u8());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(1u8);
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&1i64.to_le_bytes());
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&2i64.to_le_bytes());
        code.push(Opcode::Add.as_u8());
        code.push(Opcode::CallN.as_u8());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(1u8);
        code.push(Opcode::Halt.as_u8());

        let bytes = encode_image(&[b"hello", b"print"], &code);

        let captured = Rc::new(RefCell::new(String::new()));
        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let sink = captured.clone();
        ctx.register_native("print", move |_ctx, args| {
            let text = args.first().map(|v| v.display_canonical()).unwrap_or_default();
            sink.borrow_mut().push_str(&text);
            sink.borrow_mut().push('\n');
            Ok(Value::Nil)
        })
        .unwrap();

        let outcome = run(&mut ctx, 0).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
        assert_eq!(*captured.borrow(), "hello\n3\n");
    }

    #[test]
    fn globals_round_trip_through_bytecode() {
        let mut code = Vec::new();
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&42i64.to_le_bytes());
        code.push(Opcode::StoreG.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Opcode::LoadG.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[b"x"], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        run(&mut ctx, 0).unwrap();
        assert_eq!(ctx.stack_len(), 1);
        match ctx.peek() {
            Some(Value::Int(42)) => {}
            other => panic!("expected top Int(42), got {other:?}"),
        }
    }

    #[test]
    fn type_mismatch_cites_both_type_names() {
        let mut code = Vec::new();
        code.push(Opcode::PushS.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&1i64.to_le_bytes());
        code.push(Opcode::Add.as_u8());
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[b"s"], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let err = run(&mut ctx, 0).unwrap_err();
        assert_eq!(err, Error::Runtime);
        let msg = &ctx.last_error().unwrap().message;
        assert!(msg.contains("str"));
        assert!(msg.contains("int"));
    }

    #[test]
    fn missing_native_fails_not_found() {
        let mut code = Vec::new();
        code.push(Opcode::CallN.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(0u8);
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[b"nope"], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let err = run(&mut ctx, 0).unwrap_err();
        assert_eq!(err, Error::NotFound);
        assert!(ctx.last_error().unwrap().message.contains("nope"));
    }

    #[test]
    fn calln_argc_exceeding_stack_depth_fails_runtime() {
        let mut code = Vec::new();
        code.push(Opcode::CallN.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(3u8);
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[b"f"], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        ctx.register_native("f", |_, _| Ok(Value::Nil)).unwrap();
        let err = run(&mut ctx, 0).unwrap_err();
        assert_eq!(err, Error::Runtime);
    }

    #[test]
    fn calln_unregistered_and_under_supplied_fails_not_found() {
        // Name resolution happens before the argc check, so an unregistered
        // native wins over an empty stack with Error::NotFound, not Runtime.
        let mut code = Vec::new();
        code.push(Opcode::CallN.as_u8());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(3u8);
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[b"nope"], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let err = run(&mut ctx, 0).unwrap_err();
        assert_eq!(err, Error::NotFound);
    }

    #[test]
    fn division_by_zero_fails_runtime() {
        let mut code = Vec::new();
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&1i64.to_le_bytes());
        code.push(Opcode::PushI.as_u8());
        code.extend_from_slice(&0i64.to_le_bytes());
        code.push(Opcode::Div.as_u8());
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let err = run(&mut ctx, 0).unwrap_err();
        assert_eq!(err, Error::Runtime);
    }

    #[test]
    fn bounded_step_then_resume() {
        // Ten Nops followed by Halt; a 10-step run should stop right before
        // Halt with Ok, and a follow-up unbounded run finishes it.
        let mut code = Vec::new();
        for _ in 0..10 {
            code.push(Opcode::Nop.as_u8());
        }
        code.push(Opcode::Halt.as_u8());
        let bytes = encode_image(&[], &code);

        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        let outcome = run(&mut ctx, 10).unwrap();
        assert_eq!(outcome, RunOutcome::StepLimitReached);
        assert_eq!(ctx.ip(), 10);

        let outcome = run(&mut ctx, 0).unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
    }

    #[test]
    fn halt_immediately_after_step_is_ok() {
        let bytes = encode_image(&[], &[Opcode::Halt.as_u8()]);
        let mut ctx = Context::create(ContextConfig::default());
        ctx.load_from_memory(&bytes).unwrap();
        assert_eq!(step(&mut ctx).unwrap(), StepOutcome::Halted);
    }
}
