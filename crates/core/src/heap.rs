//! The garbage-collected heap.
//!
//! A slot arena with a tracing mark-sweep collector. The heap does not know
//! the roots; the VM enumerates them (`unmark_all` + `mark_value`/`mark_values`
//! + `sweep`). Swept slots either return to a typed pool that keeps the data
//! allocation around for reuse, or join the generic free-slot list. Pinned
//! values are additional roots handled inside `sweep`.
//!
//! Value equality, ordering, hashing, copying and rendering also live here
//! since they all need to chase handles.

use crate::error::Traceback;
use crate::object::{
    ErrorData, ExternalData, FunctionData, MapData, NativeData, NativeFn, ObjectData, StrData,
};
use crate::value::{Handle, Value};
use std::collections::HashMap;

/// Sweep is triggered once this many allocations have happened since the
/// previous sweep.
pub const SWEEP_INTERVAL: usize = 200;

const POOL_SIZE: usize = 1024;
const POOLED_ARRAY_MAX_LEN: usize = 1024;
const POOLED_MAP_MAX_LEN: usize = 1024;
const POOLED_STRING_MAX_CAPACITY: usize = 4096;

#[derive(Debug)]
struct Slot {
    generation: u32,
    marked: bool,
    /// Reclaimed (sitting in a pool or on the free list). Live handles
    /// never see such a slot because the generation was bumped.
    free: bool,
    data: ObjectData,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    string_pool: Vec<u32>,
    array_pool: Vec<u32>,
    map_pool: Vec<u32>,
    pinned: Vec<Value>,
    allocations_since_sweep: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn alloc_slot(&mut self, data: ObjectData) -> Handle {
        self.allocations_since_sweep += 1;
        if let Some(ix) = self.free_slots.pop() {
            let slot = &mut self.slots[ix as usize];
            slot.data = data;
            slot.marked = false;
            slot.free = false;
            return Handle {
                slot: ix,
                generation: slot.generation,
            };
        }
        let ix = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            marked: false,
            free: false,
            data,
        });
        Handle {
            slot: ix,
            generation: 0,
        }
    }

    /// Revive a pooled slot, keeping its data allocation.
    fn alloc_pooled(pool: &mut Vec<u32>, slots: &mut [Slot]) -> Option<Handle> {
        let ix = pool.pop()?;
        let slot = &mut slots[ix as usize];
        slot.marked = false;
        slot.free = false;
        Some(Handle {
            slot: ix,
            generation: slot.generation,
        })
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        if let Some(h) = Self::alloc_pooled(&mut self.string_pool, &mut self.slots) {
            self.allocations_since_sweep += 1;
            if let ObjectData::Str(data) = &mut self.slots[h.slot as usize].data {
                data.reset(s);
            }
            return Value::Str(h);
        }
        Value::Str(self.alloc_slot(ObjectData::Str(StrData::new(s.to_string()))))
    }

    pub fn make_array(&mut self) -> Value {
        if let Some(h) = Self::alloc_pooled(&mut self.array_pool, &mut self.slots) {
            self.allocations_since_sweep += 1;
            return Value::Array(h);
        }
        Value::Array(self.alloc_slot(ObjectData::Array(Vec::new())))
    }

    pub fn make_array_from(&mut self, items: Vec<Value>) -> Value {
        let arr = self.make_array();
        if let Some(ObjectData::Array(a)) = arr.handle().and_then(|h| self.get_mut(h)) {
            a.extend(items);
        }
        arr
    }

    pub fn make_map(&mut self) -> Value {
        if let Some(h) = Self::alloc_pooled(&mut self.map_pool, &mut self.slots) {
            self.allocations_since_sweep += 1;
            return Value::Map(h);
        }
        Value::Map(self.alloc_slot(ObjectData::Map(MapData::default())))
    }

    pub fn make_function(&mut self, data: FunctionData) -> Value {
        Value::Function(self.alloc_slot(ObjectData::Function(data)))
    }

    pub fn make_native(&mut self, name: &str, func: NativeFn) -> Value {
        Value::Native(self.alloc_slot(ObjectData::Native(NativeData {
            name: name.to_string(),
            func,
        })))
    }

    pub fn make_error(&mut self, message: &str) -> Value {
        Value::Error(self.alloc_slot(ObjectData::Error(ErrorData {
            message: message.to_string(),
            traceback: None,
        })))
    }

    pub fn make_external(&mut self, data: ExternalData) -> Value {
        Value::External(self.alloc_slot(ObjectData::External(data)))
    }

    // ------------------------------------------------------------------
    // Slot access
    // ------------------------------------------------------------------

    fn get(&self, h: Handle) -> Option<&ObjectData> {
        let slot = self.slots.get(h.slot as usize)?;
        if slot.free || slot.generation != h.generation {
            return None;
        }
        Some(&slot.data)
    }

    fn get_mut(&mut self, h: Handle) -> Option<&mut ObjectData> {
        let slot = self.slots.get_mut(h.slot as usize)?;
        if slot.free || slot.generation != h.generation {
            return None;
        }
        Some(&mut slot.data)
    }

    /// True while the handle still refers to the object it was created for.
    pub fn is_live(&self, h: Handle) -> bool {
        self.get(h).is_some()
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    pub fn str_value(&self, h: Handle) -> &str {
        match self.get(h) {
            Some(ObjectData::Str(s)) => &s.value,
            _ => "",
        }
    }

    /// Cached djb2 hash; 0 means uncomputed and computed hashes are forced
    /// nonzero, so the cache is stable once filled.
    pub fn string_hash(&mut self, h: Handle) -> u64 {
        match self.get_mut(h) {
            Some(ObjectData::Str(s)) => {
                if s.hash == 0 {
                    s.hash = hash_string(&s.value);
                }
                s.hash
            }
            _ => 0,
        }
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    pub fn array_ref(&self, h: Handle) -> &[Value] {
        match self.get(h) {
            Some(ObjectData::Array(a)) => a,
            _ => &[],
        }
    }

    pub fn array_len(&self, h: Handle) -> usize {
        self.array_ref(h).len()
    }

    pub fn array_get(&self, h: Handle, ix: i64) -> Value {
        if ix < 0 {
            return Value::Null;
        }
        self.array_ref(h).get(ix as usize).copied().unwrap_or(Value::Null)
    }

    pub fn array_push(&mut self, h: Handle, v: Value) {
        if let Some(ObjectData::Array(a)) = self.get_mut(h) {
            a.push(v);
        }
    }

    pub fn array_set(&mut self, h: Handle, ix: i64, v: Value) -> bool {
        match self.get_mut(h) {
            Some(ObjectData::Array(a)) if ix >= 0 && (ix as usize) < a.len() => {
                a[ix as usize] = v;
                true
            }
            _ => false,
        }
    }

    pub fn array_remove_at(&mut self, h: Handle, ix: usize) -> bool {
        match self.get_mut(h) {
            Some(ObjectData::Array(a)) if ix < a.len() => {
                a.remove(ix);
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Maps
    // ------------------------------------------------------------------

    pub fn map_len(&self, h: Handle) -> usize {
        match self.get(h) {
            Some(ObjectData::Map(m)) => m.len(),
            _ => 0,
        }
    }

    pub fn map_key_at(&self, h: Handle, ix: usize) -> Value {
        match self.get(h) {
            Some(ObjectData::Map(m)) => m.entries.get(ix).map(|e| e.0).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn map_value_at(&self, h: Handle, ix: usize) -> Value {
        match self.get(h) {
            Some(ObjectData::Map(m)) => m.entries.get(ix).map(|e| e.1).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn map_get(&mut self, map: Handle, key: Value) -> Value {
        let Some(hash) = self.value_hash(key) else {
            return Value::Null;
        };
        let Some(ObjectData::Map(m)) = self.get(map) else {
            return Value::Null;
        };
        if let Some(bucket) = m.index.get(&hash) {
            for &ix in bucket {
                let (k, v) = m.entries[ix as usize];
                if self.values_equal(k, key) {
                    return v;
                }
            }
        }
        Value::Null
    }

    /// Insert or replace. Returns false when the key is not hashable.
    pub fn map_set(&mut self, map: Handle, key: Value, val: Value) -> bool {
        let Some(hash) = self.value_hash(key) else {
            return false;
        };
        let mut found = None;
        match self.get(map) {
            Some(ObjectData::Map(m)) => {
                if let Some(bucket) = m.index.get(&hash) {
                    for &ix in bucket {
                        if self.values_equal(m.entries[ix as usize].0, key) {
                            found = Some(ix);
                            break;
                        }
                    }
                }
            }
            _ => return false,
        }
        if let Some(ObjectData::Map(m)) = self.get_mut(map) {
            match found {
                Some(ix) => m.entries[ix as usize].1 = val,
                None => {
                    let ix = m.entries.len() as u32;
                    m.entries.push((key, val));
                    m.index.entry(hash).or_default().push(ix);
                }
            }
        }
        true
    }

    /// A fresh `{key, value}` map for the entry at `ix` (foreach over maps).
    pub fn map_kv_pair_at(&mut self, map: Handle, ix: usize) -> Value {
        let (k, v) = match self.get(map) {
            Some(ObjectData::Map(m)) => match m.entries.get(ix) {
                Some(&entry) => entry,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
        let pair = self.make_map();
        let ph = pair.handle().expect("fresh map");
        let key_name = self.make_string("key");
        let value_name = self.make_string("value");
        self.map_set(ph, key_name, k);
        self.map_set(ph, value_name, v);
        pair
    }

    // ------------------------------------------------------------------
    // Functions, natives, errors, externals
    // ------------------------------------------------------------------

    pub fn function_ref(&self, h: Handle) -> Option<&FunctionData> {
        match self.get(h) {
            Some(ObjectData::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn function_free_val(&self, h: Handle, ix: usize) -> Value {
        self.function_ref(h)
            .and_then(|f| f.free_vals.get(ix).copied())
            .unwrap_or(Value::Null)
    }

    pub fn set_function_free_val(&mut self, h: Handle, ix: usize, v: Value) {
        if let Some(ObjectData::Function(f)) = self.get_mut(h) {
            if let Some(slot) = f.free_vals.get_mut(ix) {
                *slot = v;
            }
        }
    }

    pub fn native_ref(&self, h: Handle) -> Option<&NativeData> {
        match self.get(h) {
            Some(ObjectData::Native(n)) => Some(n),
            _ => None,
        }
    }

    pub fn error_message(&self, h: Handle) -> &str {
        match self.get(h) {
            Some(ObjectData::Error(e)) => &e.message,
            _ => "",
        }
    }

    pub fn error_traceback(&self, h: Handle) -> Option<&Traceback> {
        match self.get(h) {
            Some(ObjectData::Error(e)) => e.traceback.as_ref(),
            _ => None,
        }
    }

    pub fn error_set_traceback(&mut self, h: Handle, tb: Traceback) {
        if let Some(ObjectData::Error(e)) = self.get_mut(h) {
            e.traceback = Some(tb);
        }
    }

    pub fn external_ref(&self, h: Handle) -> Option<&ExternalData> {
        match self.get(h) {
            Some(ObjectData::External(e)) => Some(e),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Equality, ordering, hashing
    // ------------------------------------------------------------------

    /// Map-key equality: same type required, strings by content, other heap
    /// values by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a.value_type() != b.value_type() {
            return false;
        }
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => x == y || x.to_bits() == y.to_bits(),
            (Value::Str(h1), Value::Str(h2)) => {
                h1 == h2 || self.str_value(h1) == self.str_value(h2)
            }
            _ => a == b,
        }
    }

    /// Numeric ordering used by the comparison opcodes. `None` means the
    /// operands are incomparable (e.g. array vs number).
    pub fn compare(&mut self, a: Value, b: Value) -> Option<f64> {
        if a.same_bits(b) {
            return Some(0.0);
        }
        let ordered = |v: Value| matches!(v, Value::Number(_) | Value::Bool(_) | Value::Null);
        if ordered(a) && ordered(b) {
            return Some(a.as_number() - b.as_number());
        }
        if let (Value::Str(h1), Value::Str(h2)) = (a, b) {
            let (l1, l2) = (self.str_value(h1).len(), self.str_value(h2).len());
            if l1 != l2 {
                return Some(l1 as f64 - l2 as f64);
            }
            let (x1, x2) = (self.string_hash(h1), self.string_hash(h2));
            if x1 != x2 {
                return Some(x1 as f64 - x2 as f64);
            }
            return Some(match self.str_value(h1).cmp(self.str_value(h2)) {
                std::cmp::Ordering::Less => -1.0,
                std::cmp::Ordering::Equal => 0.0,
                std::cmp::Ordering::Greater => 1.0,
            });
        }
        // remaining heap values (and null) compare by identity
        let id = |v: Value| match v {
            Value::Null => Some(0.0),
            _ => v.handle().map(|h| h.slot as f64 + 1.0),
        };
        match (id(a), id(b)) {
            (Some(x), Some(y)) => Some(x - y),
            _ => None,
        }
    }

    /// Hash for the hashable subset; `None` for everything else.
    pub fn value_hash(&mut self, v: Value) -> Option<u64> {
        match v {
            Value::Number(n) => Some(hash_double(n)),
            Value::Bool(b) => Some(b as u64),
            Value::Str(h) => Some(self.string_hash(h)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Copying
    // ------------------------------------------------------------------

    /// Shallow copy: fresh container with the same elements; immutables and
    /// callables return themselves; externals go through their copy hook.
    pub fn copy_flat(&mut self, v: Value) -> Value {
        match v {
            Value::Str(h) => {
                let s = self.str_value(h).to_string();
                self.make_string(&s)
            }
            Value::Array(h) => {
                let items = self.array_ref(h).to_vec();
                self.make_array_from(items)
            }
            Value::Map(h) => {
                let entries = match self.get(h) {
                    Some(ObjectData::Map(m)) => m.entries.clone(),
                    _ => Vec::new(),
                };
                let copy = self.make_map();
                let ch = copy.handle().expect("fresh map");
                for (k, val) in entries {
                    self.map_set(ch, k, val);
                }
                copy
            }
            Value::External(h) => self.copy_external(h).unwrap_or(Value::Null),
            _ => v,
        }
    }

    /// Deep copy via an identity map keyed by handle, so shared and cyclic
    /// structures copy correctly.
    pub fn deep_copy(&mut self, v: Value) -> Value {
        let mut seen: HashMap<Handle, Value> = HashMap::new();
        self.deep_copy_internal(v, &mut seen)
    }

    fn deep_copy_internal(&mut self, v: Value, seen: &mut HashMap<Handle, Value>) -> Value {
        match v {
            Value::Str(h) => {
                let s = self.str_value(h).to_string();
                self.make_string(&s)
            }
            Value::Array(h) => {
                if let Some(&copy) = seen.get(&h) {
                    return copy;
                }
                let copy = self.make_array();
                seen.insert(h, copy);
                let ch = copy.handle().expect("fresh array");
                let items = self.array_ref(h).to_vec();
                for item in items {
                    let item_copy = self.deep_copy_internal(item, seen);
                    self.array_push(ch, item_copy);
                }
                copy
            }
            Value::Map(h) => {
                if let Some(&copy) = seen.get(&h) {
                    return copy;
                }
                let copy = self.make_map();
                seen.insert(h, copy);
                let ch = copy.handle().expect("fresh map");
                let entries = match self.get(h) {
                    Some(ObjectData::Map(m)) => m.entries.clone(),
                    _ => Vec::new(),
                };
                for (k, val) in entries {
                    let k_copy = self.deep_copy_internal(k, seen);
                    let v_copy = self.deep_copy_internal(val, seen);
                    self.map_set(ch, k_copy, v_copy);
                }
                copy
            }
            Value::External(h) => self.copy_external(h).unwrap_or(Value::Null),
            // functions, natives and errors copy by identity
            _ => v,
        }
    }

    fn copy_external(&mut self, h: Handle) -> Option<Value> {
        let ext = self.external_ref(h)?;
        let data = match &ext.copy_fn {
            Some(copy) => copy(&*ext.data),
            None => ext.data.clone(),
        };
        let copy_fn = ext.copy_fn.clone();
        let destroy_fn = ext.destroy_fn.clone();
        Some(self.make_external(ExternalData {
            data,
            copy_fn,
            destroy_fn,
        }))
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    pub fn to_display_string(&self, v: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, v, false);
        out
    }

    fn write_value(&self, out: &mut String, v: Value, quote_strings: bool) {
        match v {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
            Value::Number(n) => out.push_str(&format_number(n)),
            Value::Str(h) => {
                if quote_strings {
                    out.push('"');
                    out.push_str(self.str_value(h));
                    out.push('"');
                } else {
                    out.push_str(self.str_value(h));
                }
            }
            Value::Array(h) => {
                out.push('[');
                for (i, item) in self.array_ref(h).iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(out, *item, true);
                }
                out.push(']');
            }
            Value::Map(h) => {
                out.push('{');
                for ix in 0..self.map_len(h) {
                    if ix > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(out, self.map_key_at(h, ix), true);
                    out.push_str(": ");
                    self.write_value(out, self.map_value_at(h, ix), true);
                }
                out.push('}');
            }
            Value::Function(h) => {
                out.push_str("function ");
                out.push_str(
                    self.function_ref(h)
                        .map(|f| f.display_name())
                        .unwrap_or("anonymous"),
                );
            }
            Value::Native(h) => {
                out.push_str("native function ");
                out.push_str(self.native_ref(h).map(|n| n.name.as_str()).unwrap_or(""));
            }
            Value::Error(h) => {
                out.push_str("ERROR: ");
                out.push_str(self.error_message(h));
                if let Some(tb) = self.error_traceback(h) {
                    out.push('\n');
                    out.push_str(&tb.to_string());
                }
            }
            Value::External(_) => out.push_str("EXTERNAL"),
        }
    }

    // ------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------

    pub fn should_sweep(&self) -> bool {
        self.allocations_since_sweep > SWEEP_INTERVAL
    }

    pub fn unmark_all(&mut self) {
        for slot in &mut self.slots {
            slot.marked = false;
        }
    }

    pub fn mark_values(&mut self, values: &[Value]) {
        for v in values {
            self.mark_value(*v);
        }
    }

    pub fn mark_value(&mut self, v: Value) {
        let mut work = vec![v];
        while let Some(v) = work.pop() {
            let Some(h) = v.handle() else { continue };
            let Some(slot) = self.slots.get_mut(h.slot as usize) else {
                continue;
            };
            if slot.free || slot.generation != h.generation || slot.marked {
                continue;
            }
            slot.marked = true;
            match &slot.data {
                ObjectData::Array(items) => work.extend(items.iter().copied()),
                ObjectData::Map(m) => {
                    for (k, val) in &m.entries {
                        work.push(*k);
                        work.push(*val);
                    }
                }
                ObjectData::Function(f) => work.extend(f.free_vals.iter().copied()),
                _ => {}
            }
        }
    }

    /// Reclaim every unmarked live slot. Pinned values count as roots.
    /// Containers within the pool size caps keep their allocation and move
    /// to the typed pools; everything else is destroyed (externals run
    /// their finalizer) and the slot joins the free list.
    pub fn sweep(&mut self) {
        let pinned = self.pinned.clone();
        for v in pinned {
            self.mark_value(v);
        }
        for ix in 0..self.slots.len() {
            if self.slots[ix].free || self.slots[ix].marked {
                continue;
            }
            self.slots[ix].generation = self.slots[ix].generation.wrapping_add(1);
            self.slots[ix].free = true;
            let data = std::mem::replace(&mut self.slots[ix].data, ObjectData::Free);
            match data {
                ObjectData::Str(mut s)
                    if s.value.capacity() <= POOLED_STRING_MAX_CAPACITY
                        && self.string_pool.len() < POOL_SIZE =>
                {
                    s.value.clear();
                    s.hash = 0;
                    self.slots[ix].data = ObjectData::Str(s);
                    self.string_pool.push(ix as u32);
                }
                ObjectData::Array(mut a)
                    if a.len() <= POOLED_ARRAY_MAX_LEN && self.array_pool.len() < POOL_SIZE =>
                {
                    a.clear();
                    self.slots[ix].data = ObjectData::Array(a);
                    self.array_pool.push(ix as u32);
                }
                ObjectData::Map(mut m)
                    if m.len() <= POOLED_MAP_MAX_LEN && self.map_pool.len() < POOL_SIZE =>
                {
                    m.clear();
                    self.slots[ix].data = ObjectData::Map(m);
                    self.map_pool.push(ix as u32);
                }
                ObjectData::External(ext) => {
                    if let Some(destroy) = &ext.destroy_fn {
                        destroy(&*ext.data);
                    }
                    self.free_slots.push(ix as u32);
                }
                _ => {
                    self.free_slots.push(ix as u32);
                }
            }
        }
        self.allocations_since_sweep = 0;
    }

    /// Keep a value alive independent of reachability. Returns false when
    /// the value is not allocated or already pinned.
    pub fn pin(&mut self, v: Value) -> bool {
        if v.handle().is_none() {
            return false;
        }
        if self.pinned.contains(&v) {
            return false;
        }
        self.pinned.push(v);
        true
    }

    pub fn unpin(&mut self, v: Value) {
        self.pinned.retain(|p| *p != v);
    }
}

fn hash_string(s: &str) -> u64 {
    // djb2; never returns 0 so 0 can mean "uncomputed"
    let mut hash: u64 = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    if hash == 0 {
        1
    } else {
        hash
    }
}

fn hash_double(val: f64) -> u64 {
    // djb2 over the two 32-bit halves of the bit pattern
    let bits = val.to_bits();
    let mut hash: u64 = 5381;
    hash = hash.wrapping_mul(33).wrapping_add(bits & 0xffff_ffff);
    hash = hash.wrapping_mul(33).wrapping_add(bits >> 32);
    hash
}

/// Numbers print without a trailing `.0` when they are integral.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
