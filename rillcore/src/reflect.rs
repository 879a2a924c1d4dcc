//! Type database (component A): every replicated/event type is registered
//! as an ordered field list with a per-field read/write function, a state
//! bit and an `initial`-only flag. Registration happens once during
//! process start-up; the driver loop only ever reads the registry
//! afterwards, so a single `RwLock` is enough - process-wide, populated
//! before the event loop starts.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::{ErrorType, NetError, NetResult};
use crate::object::GhostHooks;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::any::Any;
use std::sync::RwLock;

pub const MAX_STATE_BITS: u32 = 32;

/// Identifies a registered type. Doubles as the "class index" transmitted
/// on the wire for a ghost create (spec section 4.4).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct TypeHandle(pub u16);

pub type WriteFieldFn = fn(&dyn Any, &mut BitWriter) -> NetResult<()>;
pub type ReadFieldFn = fn(&mut dyn Any, &mut BitReader) -> NetResult<()>;
pub type CompareFieldFn = fn(&dyn Any, &dyn Any) -> bool;
/// Builds a fresh, default-valued instance of a registered type. Needed on
/// the receiving side of a ghost create or an incoming event, where a
/// concrete value has to exist before its fields can be read into it.
pub type FactoryFn = fn() -> Box<dyn Any>;
/// Same idea, for types that also need to receive ghost lifecycle hooks
/// once mirrored locally.
pub type GhostFactoryFn = fn() -> Box<dyn GhostHooks>;

/// One declared field of a replicated/event type: its name, which dirty-
/// mask bit it owns, whether it is only ever sent on the first update, and
/// the function triple that reads, writes and compares it.
pub struct FieldDescriptor {
    pub name: &'static str,
    pub state_bit: u8,
    pub initial: bool,
    pub write: WriteFieldFn,
    pub read: ReadFieldFn,
    pub compare: CompareFieldFn,
}

/// An ordered field list, with an optional parent whose fields are
/// inherited. Deep inheritance chains in the original become composition
/// here: a descriptor simply walks its parent when enumerating fields or
/// allocating state bits.
pub struct TypeDescriptor {
    pub name: &'static str,
    parent: Option<TypeHandle>,
    own_fields: Vec<FieldDescriptor>,
    factory: Option<FactoryFn>,
    ghost_factory: Option<GhostFactoryFn>,
}

impl TypeDescriptor {
    pub fn new(name: &'static str, parent: Option<TypeHandle>, own_fields: Vec<FieldDescriptor>) -> TypeDescriptor {
        TypeDescriptor {
            name,
            parent,
            own_fields,
            factory: None,
            ghost_factory: None,
        }
    }

    /// Attaches a constructor, for types that need to be materialized on
    /// the receiving side (incoming events).
    pub fn with_factory(mut self, factory: FactoryFn) -> TypeDescriptor {
        self.factory = Some(factory);
        self
    }

    /// Attaches a constructor for types that are ghostable: mirrored
    /// instances need `GhostHooks`, not just `Any`.
    pub fn with_ghost_factory(mut self, factory: GhostFactoryFn) -> TypeDescriptor {
        self.ghost_factory = Some(factory);
        self
    }

    pub fn construct(&self) -> NetResult<Box<dyn Any>> {
        self.factory.map(|f| f()).ok_or(NetError::Fatal(ErrorType::UnknownClass))
    }

    pub fn construct_ghost(&self) -> NetResult<Box<dyn GhostHooks>> {
        self.ghost_factory.map(|f| f()).ok_or(NetError::Fatal(ErrorType::UnknownClass))
    }

    /// Iterates every field this type carries, parent fields first, in the
    /// order a full initial update would want to write them.
    pub fn all_fields<'a>(&'a self, registry: &'a Registry) -> Vec<&'a FieldDescriptor> {
        let mut fields = match self.parent {
            Some(parent) => registry
                .find(parent)
                .map(|p| p.all_fields(registry))
                .unwrap_or_default(),
            None => Vec::new(),
        };
        fields.extend(self.own_fields.iter());
        fields
    }

    fn state_bits_used(&self, registry: &Registry) -> u32 {
        self.all_fields(registry).iter().fold(0u32, |acc, f| acc | (1 << f.state_bit))
    }
}

/// Process-wide registry of replicated/event types. Written only during
/// initialization, read-only for the lifetime of the driver loop.
pub struct Registry {
    types: Vec<TypeDescriptor>,
    by_name: HashMap<&'static str, TypeHandle>,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            types: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registers a type. Idempotent: calling again with the same name
    /// returns the handle already assigned. Fails if two fields in the
    /// resulting field chain (own fields plus inherited ones) claim the
    /// same state bit, or if a state bit is out of the `0..32` range.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> NetResult<TypeHandle> {
        if let Some(&handle) = self.by_name.get(descriptor.name) {
            return Ok(handle);
        }

        for field in &descriptor.own_fields {
            if field.state_bit as u32 >= MAX_STATE_BITS {
                return Err(NetError::Fatal(ErrorType::UnknownStateBit));
            }
        }

        let inherited_mask = match descriptor.parent {
            Some(parent) => self
                .find(parent)
                .ok_or(NetError::Fatal(ErrorType::UnknownClass))?
                .state_bits_used(self),
            None => 0,
        };

        let mut own_mask = 0u32;
        for field in &descriptor.own_fields {
            let bit = 1u32 << field.state_bit;
            if own_mask & bit != 0 || inherited_mask & bit != 0 {
                return Err(NetError::Fatal(ErrorType::DuplicateStateBit));
            }
            own_mask |= bit;
        }

        let name = descriptor.name;
        let handle = TypeHandle(self.types.len() as u16);
        self.types.push(descriptor);
        self.by_name.insert(name, handle);

        Ok(handle)
    }

    #[inline]
    pub fn find(&self, handle: TypeHandle) -> Option<&TypeDescriptor> {
        self.types.get(handle.0 as usize)
    }

    #[inline]
    pub fn find_by_name(&self, name: &str) -> Option<TypeHandle> {
        self.by_name.get(name).copied()
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<Registry> = RwLock::new(Registry::new());
}

/// Registers a type in the process-wide registry. See `Registry::register`.
pub fn register_type(descriptor: TypeDescriptor) -> NetResult<TypeHandle> {
    REGISTRY.write().expect("type registry poisoned").register(descriptor)
}

/// Looks up a type by its handle, cloning out the data needed to encode or
/// decode with it (the field list cannot be borrowed across the registry
/// lock without holding it, so callers go through `with_type`/`write_object`/
/// `read_object` instead of `find` directly outside this module).
pub fn with_type<R>(handle: TypeHandle, f: impl FnOnce(&TypeDescriptor, &Registry) -> R) -> Option<R> {
    let registry = REGISTRY.read().expect("type registry poisoned");
    let descriptor = registry.find(handle)?;
    // SAFETY-free approach: descriptor and registry share the same read
    // guard's lifetime, so this reference is valid for the call.
    Some(f(descriptor, &registry))
}

pub fn find_type_by_name(name: &str) -> Option<TypeHandle> {
    REGISTRY.read().expect("type registry poisoned").find_by_name(name)
}

/// Constructs a fresh instance of a registered type by handle.
pub fn construct(handle: TypeHandle) -> NetResult<Box<dyn Any>> {
    with_type(handle, |descriptor, _| descriptor.construct())
        .unwrap_or(Err(NetError::Fatal(ErrorType::UnknownClass)))
}

/// Constructs a fresh ghostable instance of a registered type by handle.
pub fn construct_ghost(handle: TypeHandle) -> NetResult<Box<dyn GhostHooks>> {
    with_type(handle, |descriptor, _| descriptor.construct_ghost())
        .unwrap_or(Err(NetError::Fatal(ErrorType::UnknownClass)))
}

/// Writes every field of `object` whose state bit is set in `mask`. Fields
/// marked `initial` are only written when `initial` is true (first update
/// after a ghost's creation). Returns the subset of `mask` that could not
/// be written because the stream ran out of room - those bits must be
/// rescheduled by the caller (ghost manager section 4.4).
pub fn write_object(
    stream: &mut BitWriter,
    handle: TypeHandle,
    object: &dyn Any,
    mask: u32,
    initial: bool,
) -> NetResult<u32> {
    with_type(handle, |descriptor, registry| {
        let mut residual = mask;
        for field in descriptor.all_fields(registry) {
            let bit = 1u32 << field.state_bit;
            if mask & bit == 0 {
                continue;
            }
            if field.initial && !initial {
                continue;
            }

            let start = stream.mark();
            match (field.write)(object, stream) {
                Ok(()) => residual &= !bit,
                Err(NetError::Wait) => {
                    stream.rewind(start);
                    break;
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Ok(residual)
    })
    .unwrap_or(Err(NetError::Fatal(ErrorType::UnknownClass)))
}

/// Inverse of `write_object`: must consume exactly the bits the writer
/// produced for the same mask and `initial` flag.
pub fn read_object(
    stream: &mut BitReader,
    handle: TypeHandle,
    object: &mut dyn Any,
    mask: u32,
    initial: bool,
) -> NetResult<()> {
    with_type(handle, |descriptor, registry| {
        for field in descriptor.all_fields(registry) {
            let bit = 1u32 << field.state_bit;
            if mask & bit == 0 {
                continue;
            }
            if field.initial && !initial {
                continue;
            }
            (field.read)(object, stream)?;
        }
        Ok(())
    })
    .unwrap_or(Err(NetError::Fatal(ErrorType::UnknownClass)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    struct Point {
        x: i32,
        y: i32,
    }

    fn write_x(obj: &dyn Any, s: &mut BitWriter) -> NetResult<()> {
        s.write_signed(obj.downcast_ref::<Point>().unwrap().x, 16)
    }
    fn read_x(obj: &mut dyn Any, s: &mut crate::bitstream::BitReader) -> NetResult<()> {
        obj.downcast_mut::<Point>().unwrap().x = s.read_signed(16)?;
        Ok(())
    }
    fn write_y(obj: &dyn Any, s: &mut BitWriter) -> NetResult<()> {
        s.write_signed(obj.downcast_ref::<Point>().unwrap().y, 16)
    }
    fn read_y(obj: &mut dyn Any, s: &mut crate::bitstream::BitReader) -> NetResult<()> {
        obj.downcast_mut::<Point>().unwrap().y = s.read_signed(16)?;
        Ok(())
    }
    fn always_equal(_: &dyn Any, _: &dyn Any) -> bool {
        true
    }

    fn register_point(name: &'static str) -> TypeHandle {
        register_type(TypeDescriptor::new(
            name,
            None,
            vec![
                FieldDescriptor {
                    name: "x",
                    state_bit: 0,
                    initial: false,
                    write: write_x,
                    read: read_x,
                    compare: always_equal,
                },
                FieldDescriptor {
                    name: "y",
                    state_bit: 1,
                    initial: false,
                    write: write_y,
                    read: read_y,
                    compare: always_equal,
                },
            ],
        ))
        .unwrap()
    }

    #[test]
    fn register_is_idempotent() {
        let a = register_point("reflect::tests::PointA");
        let b = register_point("reflect::tests::PointA");
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_state_bit_is_rejected() {
        let result = register_type(TypeDescriptor::new(
            "reflect::tests::Dup",
            None,
            vec![
                FieldDescriptor {
                    name: "a",
                    state_bit: 0,
                    initial: false,
                    write: write_x,
                    read: read_x,
                    compare: always_equal,
                },
                FieldDescriptor {
                    name: "b",
                    state_bit: 0,
                    initial: false,
                    write: write_y,
                    read: read_y,
                    compare: always_equal,
                },
            ],
        ));
        assert_eq!(result, Err(NetError::Fatal(ErrorType::DuplicateStateBit)));
    }

    #[test]
    fn write_then_read_only_touches_masked_bits() {
        let handle = register_point("reflect::tests::PointB");
        let obj = Point { x: 12, y: -7 };

        let mut writer = BitWriter::new(8);
        let residual = write_object(&mut writer, handle, &obj, 0b01, true).unwrap();
        assert_eq!(residual, 0);

        let bytes = writer.bytes().to_vec();
        let mut reader = crate::bitstream::BitReader::new(&bytes);
        let mut decoded = Point { x: 0, y: 0 };
        read_object(&mut reader, handle, &mut decoded, 0b01, true).unwrap();

        assert_eq!(decoded.x, 12);
        // y's bit was not in the mask, so it must be untouched.
        assert_eq!(decoded.y, 0);
    }

    #[test]
    fn write_object_returns_residual_when_stream_is_full() {
        let handle = register_point("reflect::tests::PointC");
        let obj = Point { x: 1, y: 2 };

        // Only 16 bits available - enough for exactly one field.
        let mut writer = BitWriter::new(2);
        let residual = write_object(&mut writer, handle, &obj, 0b11, true).unwrap();
        assert_eq!(residual, 0b10);
    }
}
