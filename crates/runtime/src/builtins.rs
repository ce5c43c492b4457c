//! Builtin native functions.
//!
//! Installed into the global store at context construction. Each builtin
//! is an `Rc` closure over the heap; the I/O builtins additionally capture
//! the context's hook table so embedders can redirect them.

use crate::io::Io;
use ape_compiler::GlobalStore;
use ape_core::{Heap, NativeError, NativeFn, TypeMask, Value, ValueType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::rc::Rc;

/// Argument count + type checking shared by every builtin.
fn check_args(args: &[Value], expected: &[TypeMask]) -> Result<(), NativeError> {
    if args.len() != expected.len() {
        return Err(NativeError::runtime(format!(
            "Invalid number of arguments, got {} instead of {}",
            args.len(),
            expected.len()
        )));
    }
    for (ix, (arg, mask)) in args.iter().zip(expected).enumerate() {
        if !mask.contains(arg.value_type()) {
            return Err(NativeError::runtime(format!(
                "Invalid argument {} type, got {}",
                ix,
                arg.type_name()
            )));
        }
    }
    Ok(())
}

fn number_arg(v: Value) -> f64 {
    v.as_number()
}

/// Install every builtin into the store.
pub fn install(store: &mut GlobalStore, heap: &mut Heap, io: &Rc<Io>) {
    let rng: Rc<RefCell<StdRng>> = Rc::new(RefCell::new(StdRng::from_entropy()));

    let add = |store: &mut GlobalStore, heap: &mut Heap, name: &str, func: NativeFn| {
        let native = heap.make_native(name, func);
        store.set(name, native);
    };

    // ------------------------------------------------------------------
    // collections
    // ------------------------------------------------------------------

    add(store, heap, "len", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::STRING | TypeMask::ARRAY | TypeMask::MAP])?;
        let len = match args[0] {
            Value::Str(h) => heap.str_value(h).len(),
            Value::Array(h) => heap.array_len(h),
            Value::Map(h) => heap.map_len(h),
            _ => unreachable!(),
        };
        Ok(Value::Number(len as f64))
    }));

    add(store, heap, "first", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY])?;
        let h = args[0].handle().expect("array");
        Ok(heap.array_get(h, 0))
    }));

    add(store, heap, "last", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY])?;
        let h = args[0].handle().expect("array");
        let len = heap.array_len(h);
        Ok(heap.array_get(h, len as i64 - 1))
    }));

    add(store, heap, "rest", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY])?;
        let h = args[0].handle().expect("array");
        if heap.array_len(h) == 0 {
            return Ok(Value::Null);
        }
        let items = heap.array_ref(h)[1..].to_vec();
        Ok(heap.make_array_from(items))
    }));

    add(store, heap, "reverse", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY | TypeMask::STRING])?;
        match args[0] {
            Value::Array(h) => {
                let mut items = heap.array_ref(h).to_vec();
                items.reverse();
                Ok(heap.make_array_from(items))
            }
            Value::Str(h) => {
                let reversed: String = heap.str_value(h).chars().rev().collect();
                Ok(heap.make_string(&reversed))
            }
            _ => unreachable!(),
        }
    }));

    add(store, heap, "array", Rc::new(|heap, args| {
        if args.len() == 1 {
            check_args(args, &[TypeMask::NUMBER])?;
            let n = number_arg(args[0]) as usize;
            return Ok(heap.make_array_from(vec![Value::Null; n]));
        }
        check_args(args, &[TypeMask::NUMBER, TypeMask::ANY])?;
        let n = number_arg(args[0]) as usize;
        Ok(heap.make_array_from(vec![args[1]; n]))
    }));

    add(store, heap, "append", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY, TypeMask::ANY])?;
        let h = args[0].handle().expect("array");
        heap.array_push(h, args[1]);
        Ok(Value::Number(heap.array_len(h) as f64))
    }));

    add(store, heap, "concat", Rc::new(|heap, args| {
        check_args(args, &[
            TypeMask::ARRAY | TypeMask::STRING,
            TypeMask::ARRAY | TypeMask::STRING,
        ])?;
        match (args[0], args[1]) {
            (Value::Array(lh), Value::Array(rh)) => {
                let items = heap.array_ref(rh).to_vec();
                for item in items {
                    heap.array_push(lh, item);
                }
                Ok(Value::Number(heap.array_len(lh) as f64))
            }
            (Value::Str(lh), Value::Str(rh)) => {
                let combined = format!("{}{}", heap.str_value(lh), heap.str_value(rh));
                Ok(heap.make_string(&combined))
            }
            _ => Err(NativeError::runtime("Invalid operand types")),
        }
    }));

    add(store, heap, "remove", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY, TypeMask::ANY])?;
        let h = args[0].handle().expect("array");
        let items = heap.array_ref(h).to_vec();
        let found = items
            .iter()
            .position(|item| heap.values_equal(*item, args[1]));
        match found {
            Some(ix) => Ok(Value::Bool(heap.array_remove_at(h, ix))),
            None => Ok(Value::Bool(false)),
        }
    }));

    add(store, heap, "remove_at", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY, TypeMask::NUMBER])?;
        let h = args[0].handle().expect("array");
        let ix = number_arg(args[1]) as i64;
        if ix < 0 {
            return Ok(Value::Bool(false));
        }
        Ok(Value::Bool(heap.array_remove_at(h, ix as usize)))
    }));

    add(store, heap, "slice", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ARRAY | TypeMask::STRING, TypeMask::NUMBER])?;
        let ix = number_arg(args[1]) as i64;
        match args[0] {
            Value::Array(h) => {
                let len = heap.array_len(h) as i64;
                let start = if ix < 0 { (len + ix).max(0) } else { ix.min(len) };
                let items = heap.array_ref(h)[start as usize..].to_vec();
                Ok(heap.make_array_from(items))
            }
            Value::Str(h) => {
                let len = heap.str_value(h).len() as i64;
                let start = if ix < 0 { (len + ix).max(0) } else { ix.min(len) };
                let sliced = heap.str_value(h).as_bytes()[start as usize..].to_vec();
                let sliced = String::from_utf8_lossy(&sliced).into_owned();
                Ok(heap.make_string(&sliced))
            }
            _ => unreachable!(),
        }
    }));

    add(store, heap, "range", Rc::new(|heap, args| {
        let (start, end, step) = match args.len() {
            1 => {
                check_args(args, &[TypeMask::NUMBER])?;
                (0.0, number_arg(args[0]), 1.0)
            }
            2 => {
                check_args(args, &[TypeMask::NUMBER, TypeMask::NUMBER])?;
                (number_arg(args[0]), number_arg(args[1]), 1.0)
            }
            _ => {
                check_args(args, &[TypeMask::NUMBER, TypeMask::NUMBER, TypeMask::NUMBER])?;
                (number_arg(args[0]), number_arg(args[1]), number_arg(args[2]))
            }
        };
        if step == 0.0 {
            return Err(NativeError::runtime("Range step cannot be 0"));
        }
        let mut items = Vec::new();
        let mut current = start;
        while (step > 0.0 && current < end) || (step < 0.0 && current > end) {
            items.push(Value::Number(current));
            current += step;
        }
        Ok(heap.make_array_from(items))
    }));

    add(store, heap, "keys", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::MAP])?;
        let h = args[0].handle().expect("map");
        let keys: Vec<Value> = (0..heap.map_len(h)).map(|ix| heap.map_key_at(h, ix)).collect();
        Ok(heap.make_array_from(keys))
    }));

    add(store, heap, "values", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::MAP])?;
        let h = args[0].handle().expect("map");
        let values: Vec<Value> =
            (0..heap.map_len(h)).map(|ix| heap.map_value_at(h, ix)).collect();
        Ok(heap.make_array_from(values))
    }));

    add(store, heap, "copy", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ANY])?;
        Ok(heap.copy_flat(args[0]))
    }));

    add(store, heap, "deep_copy", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ANY])?;
        Ok(heap.deep_copy(args[0]))
    }));

    // ------------------------------------------------------------------
    // conversion
    // ------------------------------------------------------------------

    add(store, heap, "to_str", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::ANY])?;
        let rendered = heap.to_display_string(args[0]);
        Ok(heap.make_string(&rendered))
    }));

    add(store, heap, "to_num", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::STRING | TypeMask::NUMBER])?;
        match args[0] {
            Value::Number(_) => Ok(args[0]),
            Value::Str(h) => heap
                .str_value(h)
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| NativeError::runtime("Cannot convert to number")),
            _ => unreachable!(),
        }
    }));

    add(store, heap, "chr", Rc::new(|heap, args| {
        check_args(args, &[TypeMask::NUMBER])?;
        let code = number_arg(args[0]) as u32;
        match char::from_u32(code) {
            Some(c) => Ok(heap.make_string(&c.to_string())),
            None => Err(NativeError::runtime("Invalid character code")),
        }
    }));

    // ------------------------------------------------------------------
    // I/O
    // ------------------------------------------------------------------

    let io_println = io.clone();
    add(store, heap, "println", Rc::new(move |heap, args| {
        let mut out = String::new();
        for arg in args {
            out.push_str(&heap.to_display_string(*arg));
        }
        out.push('\n');
        io_println.write_stdout(out.as_bytes());
        Ok(Value::Null)
    }));

    let io_print = io.clone();
    add(store, heap, "print", Rc::new(move |heap, args| {
        let mut out = String::new();
        for arg in args {
            out.push_str(&heap.to_display_string(*arg));
        }
        io_print.write_stdout(out.as_bytes());
        Ok(Value::Null)
    }));

    // ------------------------------------------------------------------
    // errors and assertions
    // ------------------------------------------------------------------

    add(store, heap, "error", Rc::new(|heap, args| {
        let message = match args.first() {
            Some(Value::Str(h)) => heap.str_value(*h).to_string(),
            Some(other) => heap.to_display_string(*other),
            None => String::new(),
        };
        Ok(heap.make_error(&message))
    }));

    add(store, heap, "crash", Rc::new(|heap, args| {
        let message = match args.first() {
            Some(Value::Str(h)) => heap.str_value(*h).to_string(),
            Some(other) => heap.to_display_string(*other),
            None => "crash".to_string(),
        };
        Err(NativeError::runtime(message))
    }));

    add(store, heap, "assert", Rc::new(|_heap, args| {
        check_args(args, &[TypeMask::BOOL])?;
        match args[0] {
            Value::Bool(true) => Ok(Value::Bool(true)),
            _ => Err(NativeError::runtime("assertion failed")),
        }
    }));

    // ------------------------------------------------------------------
    // type predicates
    // ------------------------------------------------------------------

    let predicates: &[(&str, ValueType)] = &[
        ("is_string", ValueType::Str),
        ("is_array", ValueType::Array),
        ("is_map", ValueType::Map),
        ("is_number", ValueType::Number),
        ("is_bool", ValueType::Bool),
        ("is_null", ValueType::Null),
        ("is_function", ValueType::Function),
        ("is_external", ValueType::External),
        ("is_error", ValueType::Error),
        ("is_native_function", ValueType::Native),
    ];
    for &(name, expected) in predicates {
        add(store, heap, name, Rc::new(move |_heap, args| {
            check_args(args, &[TypeMask::ANY])?;
            Ok(Value::Bool(args[0].value_type() == expected))
        }));
    }

    // ------------------------------------------------------------------
    // math
    // ------------------------------------------------------------------

    fn math1(f: fn(f64) -> f64) -> NativeFn {
        Rc::new(move |_heap, args| {
            check_args(args, &[TypeMask::NUMBER])?;
            Ok(Value::Number(f(number_arg(args[0]))))
        })
    }

    add(store, heap, "sqrt", math1(f64::sqrt));
    add(store, heap, "sin", math1(f64::sin));
    add(store, heap, "cos", math1(f64::cos));
    add(store, heap, "tan", math1(f64::tan));
    add(store, heap, "log", math1(f64::ln));
    add(store, heap, "ceil", math1(f64::ceil));
    add(store, heap, "floor", math1(f64::floor));
    add(store, heap, "abs", math1(f64::abs));

    add(store, heap, "pow", Rc::new(|_heap, args| {
        check_args(args, &[TypeMask::NUMBER, TypeMask::NUMBER])?;
        Ok(Value::Number(number_arg(args[0]).powf(number_arg(args[1]))))
    }));

    let seed_rng = rng.clone();
    add(store, heap, "random_seed", Rc::new(move |_heap, args| {
        check_args(args, &[TypeMask::NUMBER])?;
        *seed_rng.borrow_mut() = StdRng::seed_from_u64(number_arg(args[0]) as u64);
        Ok(Value::Null)
    }));

    let random_rng = rng;
    add(store, heap, "random", Rc::new(move |_heap, args| {
        match args.len() {
            0 => Ok(Value::Number(random_rng.borrow_mut().gen::<f64>())),
            2 => {
                check_args(args, &[TypeMask::NUMBER, TypeMask::NUMBER])?;
                let min = number_arg(args[0]);
                let max = number_arg(args[1]);
                if min >= max {
                    return Err(NativeError::runtime("Max is bigger than min"));
                }
                Ok(Value::Number(random_rng.borrow_mut().gen_range(min..max)))
            }
            n => Err(NativeError::runtime(format!(
                "Invalid number of arguments, got {} instead of 0 or 2",
                n
            ))),
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_args_validates_count_and_types() {
        let mut heap = Heap::new();
        let s = heap.make_string("x");
        assert!(check_args(&[s], &[TypeMask::STRING]).is_ok());
        assert!(check_args(&[s], &[TypeMask::NUMBER]).is_err());
        assert!(check_args(&[], &[TypeMask::NUMBER]).is_err());
        assert!(check_args(&[s], &[TypeMask::STRING | TypeMask::NUMBER]).is_ok());
        assert!(check_args(&[Value::Null], &[TypeMask::ANY]).is_ok());
    }
}
