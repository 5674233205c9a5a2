use std::collections::HashMap;

use crate::error::LoadError;
use crate::il::{Instr, MethodBody, MethodRef};

use super::{
    ClassDesc, ClassId, FieldDesc, FieldId, Metadata, MethodDesc, MethodFlags, MethodId,
    MethodImpl, Signature, TypeDesc, WellKnown, align8,
};

/// Declaration of a method before its implementation is attached.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
    pub flags: MethodFlags,
    pub generic_params: u16,
}

impl MethodDef {
    pub fn static_(name: &str, params: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            flags: MethodFlags {
                is_static: true,
                ..Default::default()
            },
            generic_params: 0,
        }
    }

    pub fn instance(name: &str, params: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        Self {
            name: name.to_string(),
            params,
            ret,
            flags: MethodFlags::default(),
            generic_params: 0,
        }
    }

    pub fn virtual_(mut self) -> Self {
        self.flags.is_virtual = true;
        self
    }

    pub fn final_(mut self) -> Self {
        self.flags.is_final = true;
        self
    }

    pub fn newslot(mut self) -> Self {
        self.flags.is_newslot = true;
        self
    }

    pub fn abstract_(mut self) -> Self {
        self.flags.is_virtual = true;
        self.flags.is_abstract = true;
        self
    }

    pub fn generic(mut self, count: u16) -> Self {
        self.generic_params = count;
        self
    }
}

/// Incrementally defines a [`Metadata`].
///
/// `new` seeds the core library classes listed in [`WellKnown`] so user
/// classes can derive from `System.Object` and throw the runtime's
/// exception types.
pub struct MetadataBuilder {
    classes: Vec<ClassDesc>,
    fields: Vec<FieldDesc>,
    methods: Vec<MethodDesc>,
    by_name: HashMap<String, ClassId>,
}

const EXCEPTION_CLASSES: &[(WellKnown, &str, WellKnown)] = &[
    (WellKnown::ArithmeticException, "System.ArithmeticException", WellKnown::Exception),
    (WellKnown::DivideByZeroException, "System.DivideByZeroException", WellKnown::ArithmeticException),
    (WellKnown::OverflowException, "System.OverflowException", WellKnown::ArithmeticException),
    (WellKnown::NullReferenceException, "System.NullReferenceException", WellKnown::Exception),
    (WellKnown::IndexOutOfRangeException, "System.IndexOutOfRangeException", WellKnown::Exception),
    (WellKnown::InvalidCastException, "System.InvalidCastException", WellKnown::Exception),
    (WellKnown::ArrayTypeMismatchException, "System.ArrayTypeMismatchException", WellKnown::Exception),
    (WellKnown::StackOverflowException, "System.StackOverflowException", WellKnown::Exception),
    (WellKnown::ThreadInterruptedException, "System.Threading.ThreadInterruptedException", WellKnown::Exception),
    (WellKnown::MissingMethodException, "System.MissingMethodException", WellKnown::Exception),
    (WellKnown::ExecutionEngineException, "System.ExecutionEngineException", WellKnown::Exception),
    (WellKnown::OutOfMemoryException, "System.OutOfMemoryException", WellKnown::Exception),
];

const PRIMITIVE_CLASSES: &[(WellKnown, &str, TypeDesc)] = &[
    (WellKnown::Boolean, "System.Boolean", TypeDesc::Bool),
    (WellKnown::Char, "System.Char", TypeDesc::Char),
    (WellKnown::SByte, "System.SByte", TypeDesc::I1),
    (WellKnown::Byte, "System.Byte", TypeDesc::U1),
    (WellKnown::Int16, "System.Int16", TypeDesc::I2),
    (WellKnown::UInt16, "System.UInt16", TypeDesc::U2),
    (WellKnown::Int32, "System.Int32", TypeDesc::I4),
    (WellKnown::UInt32, "System.UInt32", TypeDesc::U4),
    (WellKnown::Int64, "System.Int64", TypeDesc::I8),
    (WellKnown::UInt64, "System.UInt64", TypeDesc::U8),
    (WellKnown::Single, "System.Single", TypeDesc::R4),
    (WellKnown::Double, "System.Double", TypeDesc::R8),
    (WellKnown::IntPtr, "System.IntPtr", TypeDesc::I),
    (WellKnown::UIntPtr, "System.UIntPtr", TypeDesc::U),
];

/// Name of the field holding an exception's message.
pub const EXCEPTION_MESSAGE_FIELD: &str = "_message";

impl MetadataBuilder {
    pub fn new() -> Self {
        let mut b = Self {
            classes: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            by_name: HashMap::new(),
        };
        b.seed_corlib();
        b
    }

    fn push_class(&mut self, name: &str, parent: Option<ClassId>, is_value_type: bool) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDesc {
            name: name.to_string(),
            parent,
            is_value_type,
            fields: Vec::new(),
            methods: Vec::new(),
            vtable: Vec::new(),
            instance_size: 0,
            static_size: 0,
            primitive: None,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn seed_corlib(&mut self) {
        let object = self.push_class("System.Object", None, false);
        let value_type = self.push_class("System.ValueType", Some(object), false);
        let string = self.push_class("System.String", Some(object), false);
        self.push_class("System.Array", Some(object), false);
        let exception = self.push_class("System.Exception", Some(object), false);
        debug_assert_eq!(exception, WellKnown::Exception.id());

        let ctor = self.add_method(object, MethodDef::instance(".ctor", vec![], TypeDesc::Void));
        self.set_body(ctor, body(vec![Instr::Ret]));

        let len = self.add_method(string, MethodDef::instance("get_Length", vec![], TypeDesc::I4));
        self.set_impl(len, MethodImpl::InternalCall("System.String::get_Length".into()));
        let chars = self.add_method(
            string,
            MethodDef::instance("get_Chars", vec![TypeDesc::I4], TypeDesc::Char),
        );
        self.set_impl(chars, MethodImpl::InternalCall("System.String::get_Chars".into()));
        let concat = self.add_method(
            string,
            MethodDef::static_("Concat", vec![TypeDesc::String, TypeDesc::String], TypeDesc::String),
        );
        self.set_impl(concat, MethodImpl::InternalCall("System.String::Concat".into()));

        let message = self.add_field(exception, EXCEPTION_MESSAGE_FIELD, TypeDesc::String, false);
        let base_ctor = self.add_method(exception, MethodDef::instance(".ctor", vec![], TypeDesc::Void));
        self.set_body(
            base_ctor,
            body(vec![Instr::Ldarg(0), Instr::Call(MethodRef::new(ctor)), Instr::Ret]),
        );
        let msg_ctor = self.add_method(
            exception,
            MethodDef::instance(".ctor", vec![TypeDesc::String], TypeDesc::Void),
        );
        self.set_body(
            msg_ctor,
            body(vec![
                Instr::Ldarg(0),
                Instr::Call(MethodRef::new(ctor)),
                Instr::Ldarg(0),
                Instr::Ldarg(1),
                Instr::Stfld(message),
                Instr::Ret,
            ]),
        );
        let get_message = self.add_method(
            exception,
            MethodDef::instance("get_Message", vec![], TypeDesc::String).virtual_(),
        );
        self.set_body(
            get_message,
            body(vec![Instr::Ldarg(0), Instr::Ldfld(message), Instr::Ret]),
        );

        for (which, name, parent) in EXCEPTION_CLASSES {
            let id = self.push_class(name, Some(parent.id()), false);
            debug_assert_eq!(id, which.id());
            let parent_ctor = self.ctor_of(parent.id(), 0);
            let parent_msg_ctor = self.ctor_of(parent.id(), 1);
            let c0 = self.add_method(id, MethodDef::instance(".ctor", vec![], TypeDesc::Void));
            self.set_body(
                c0,
                body(vec![Instr::Ldarg(0), Instr::Call(MethodRef::new(parent_ctor)), Instr::Ret]),
            );
            let c1 = self.add_method(
                id,
                MethodDef::instance(".ctor", vec![TypeDesc::String], TypeDesc::Void),
            );
            self.set_body(
                c1,
                body(vec![
                    Instr::Ldarg(0),
                    Instr::Ldarg(1),
                    Instr::Call(MethodRef::new(parent_msg_ctor)),
                    Instr::Ret,
                ]),
            );
        }

        let console = self.push_class("System.Console", Some(object), false);
        debug_assert_eq!(console, WellKnown::Console.id());
        for (name, param) in [
            ("WriteLine", TypeDesc::String),
            ("WriteLine", TypeDesc::I4),
            ("WriteLine", TypeDesc::I8),
            ("WriteLine", TypeDesc::R8),
            ("Write", TypeDesc::String),
        ] {
            let icall = format!("System.Console::{name}({})", param_keyword(&param));
            let m = self.add_method(console, MethodDef::static_(name, vec![param], TypeDesc::Void));
            self.set_impl(m, MethodImpl::InternalCall(icall));
        }

        for (which, name, prim) in PRIMITIVE_CLASSES {
            let id = self.push_class(name, Some(value_type), true);
            debug_assert_eq!(id, which.id());
            self.classes[id.0 as usize].primitive = Some(prim.clone());
            self.add_field(id, "m_value", prim.clone(), false);
        }
    }

    fn ctor_of(&self, class: ClassId, params: usize) -> MethodId {
        self.classes[class.0 as usize]
            .methods
            .iter()
            .copied()
            .find(|m| {
                let m = &self.methods[m.0 as usize];
                m.name == ".ctor" && m.sig.params.len() == params
            })
            .unwrap_or(MethodId(0))
    }

    pub fn define_class(&mut self, name: &str, parent: Option<ClassId>) -> Result<ClassId, LoadError> {
        if self.by_name.contains_key(name) {
            return Err(LoadError::Duplicate(name.to_string()));
        }
        Ok(self.push_class(name, Some(parent.unwrap_or(WellKnown::Object.id())), false))
    }

    pub fn define_value_type(&mut self, name: &str) -> Result<ClassId, LoadError> {
        if self.by_name.contains_key(name) {
            return Err(LoadError::Duplicate(name.to_string()));
        }
        Ok(self.push_class(name, Some(WellKnown::ValueType.id()), true))
    }

    pub fn add_field(&mut self, class: ClassId, name: &str, ty: TypeDesc, is_static: bool) -> FieldId {
        let id = FieldId(self.fields.len() as u32);
        self.fields.push(FieldDesc {
            name: name.to_string(),
            owner: class,
            ty,
            is_static,
            offset: 0,
        });
        self.classes[class.0 as usize].fields.push(id);
        id
    }

    pub fn add_method(&mut self, class: ClassId, def: MethodDef) -> MethodId {
        let id = MethodId(self.methods.len() as u32);
        let imp = if def.flags.is_abstract {
            MethodImpl::Abstract
        } else {
            MethodImpl::Il(MethodBody::default())
        };
        self.methods.push(MethodDesc {
            name: def.name,
            owner: class,
            sig: Signature {
                has_this: !def.flags.is_static,
                params: def.params,
                ret: def.ret,
            },
            flags: def.flags,
            generic_params: def.generic_params,
            imp,
            slot: None,
        });
        self.classes[class.0 as usize].methods.push(id);
        id
    }

    pub fn set_body(&mut self, method: MethodId, body: MethodBody) {
        self.methods[method.0 as usize].imp = MethodImpl::Il(body);
    }

    pub fn set_impl(&mut self, method: MethodId, imp: MethodImpl) {
        self.methods[method.0 as usize].imp = imp;
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn class_name(&self, id: ClassId) -> &str {
        &self.classes[id.0 as usize].name
    }

    /// Method lookup by `Class::name` or `Class::name(params)`.
    pub fn find_method(&self, spec: &str) -> Option<MethodId> {
        let (class, name, params) = super::split_member_spec(spec)?;
        let class = self.find_class(class)?;
        let params = match params {
            Some(list) => Some(
                list.iter()
                    .map(|p| TypeDesc::parse(p, &|n| self.find_class(n)).ok())
                    .collect::<Option<Vec<_>>>()?,
            ),
            None => None,
        };
        self.classes[class.0 as usize].methods.iter().copied().find(|m| {
            let desc = &self.methods[m.0 as usize];
            desc.name == name && params.as_ref().is_none_or(|p| *p == desc.sig.params)
        })
    }

    pub fn find_field(&self, spec: &str) -> Option<FieldId> {
        let (class, name, _) = super::split_member_spec(spec)?;
        let mut class = self.find_class(class);
        while let Some(c) = class {
            let desc = &self.classes[c.0 as usize];
            if let Some(f) = desc
                .fields
                .iter()
                .copied()
                .find(|f| self.fields[f.0 as usize].name == name)
            {
                return Some(f);
            }
            class = desc.parent;
        }
        None
    }

    /// Compute field layouts and vtables.
    pub fn finish(mut self) -> Result<Metadata, LoadError> {
        let mut state = vec![Layout::Pending; self.classes.len()];
        for i in 0..self.classes.len() {
            self.layout_class(ClassId(i as u32), &mut state)?;
        }
        self.build_vtables();
        Ok(Metadata {
            classes: self.classes,
            fields: self.fields,
            methods: self.methods,
            by_name: self.by_name,
        })
    }

    fn layout_class(&mut self, class: ClassId, state: &mut [Layout]) -> Result<(), LoadError> {
        match state[class.0 as usize] {
            Layout::Done => return Ok(()),
            Layout::InProgress => {
                return Err(LoadError::Invalid(format!(
                    "value type `{}` contains itself",
                    self.classes[class.0 as usize].name
                )));
            }
            Layout::Pending => {}
        }
        state[class.0 as usize] = Layout::InProgress;

        let parent_size = match self.classes[class.0 as usize].parent {
            Some(p) => {
                self.layout_class(p, state)?;
                self.classes[p.0 as usize].instance_size
            }
            None => 0,
        };

        // Value-type fields need their own layout first.
        let field_ids = self.classes[class.0 as usize].fields.clone();
        for &f in &field_ids {
            if let TypeDesc::Class(c) = self.fields[f.0 as usize].ty {
                if self.classes[c.0 as usize].is_value_type && c != class {
                    self.layout_class(c, state)?;
                }
            }
        }

        let is_value_type = self.classes[class.0 as usize].is_value_type;
        let mut instance = if is_value_type { 0 } else { parent_size };
        let mut statics = 0u32;
        for &f in &field_ids {
            let (size, align) = self.field_size_align(&self.fields[f.0 as usize].ty)?;
            let field = &mut self.fields[f.0 as usize];
            let cursor = if field.is_static { &mut statics } else { &mut instance };
            *cursor = (*cursor + align - 1) & !(align - 1);
            field.offset = *cursor;
            *cursor += size;
        }

        let desc = &mut self.classes[class.0 as usize];
        desc.instance_size = if is_value_type {
            align8(instance.max(1))
        } else {
            align8(instance)
        };
        desc.static_size = align8(statics);
        state[class.0 as usize] = Layout::Done;
        Ok(())
    }

    fn field_size_align(&self, ty: &TypeDesc) -> Result<(u32, u32), LoadError> {
        Ok(match ty {
            TypeDesc::Void => return Err(LoadError::Invalid("field of type void".into())),
            TypeDesc::MVar(_) => {
                return Err(LoadError::Invalid("field of generic parameter type".into()));
            }
            TypeDesc::Bool | TypeDesc::I1 | TypeDesc::U1 => (1, 1),
            TypeDesc::Char | TypeDesc::I2 | TypeDesc::U2 => (2, 2),
            TypeDesc::I4 | TypeDesc::U4 | TypeDesc::R4 => (4, 4),
            TypeDesc::Class(c) if self.classes[c.0 as usize].is_value_type => {
                (self.classes[c.0 as usize].instance_size, 8)
            }
            _ => (8, 8),
        })
    }

    fn build_vtables(&mut self) {
        // Parents precede children in id order.
        for i in 0..self.classes.len() {
            let mut vtable = match self.classes[i].parent {
                Some(p) => self.classes[p.0 as usize].vtable.clone(),
                None => Vec::new(),
            };
            for &m in &self.classes[i].methods.clone() {
                let desc = &self.methods[m.0 as usize];
                if !desc.flags.is_virtual {
                    continue;
                }
                let inherited = if desc.flags.is_newslot {
                    None
                } else {
                    vtable.iter().position(|&slot_method| {
                        let other = &self.methods[slot_method.0 as usize];
                        other.name == desc.name && other.sig == desc.sig
                    })
                };
                let slot = match inherited {
                    Some(slot) => {
                        vtable[slot] = m;
                        slot
                    }
                    None => {
                        vtable.push(m);
                        vtable.len() - 1
                    }
                };
                self.methods[m.0 as usize].slot = Some(slot as u16);
            }
            self.classes[i].vtable = vtable;
        }
    }
}

impl Default for MetadataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Pending,
    InProgress,
    Done,
}

fn body(code: Vec<Instr>) -> MethodBody {
    MethodBody {
        max_stack: 4,
        code,
        ..Default::default()
    }
}

fn param_keyword(ty: &TypeDesc) -> &'static str {
    match ty {
        TypeDesc::String => "string",
        TypeDesc::I4 => "i4",
        TypeDesc::I8 => "i8",
        TypeDesc::R8 => "r8",
        _ => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_ids_match_well_known() {
        let md = MetadataBuilder::new().finish().unwrap();
        assert_eq!(md.class(WellKnown::Object.id()).name, "System.Object");
        assert_eq!(md.class(WellKnown::DivideByZeroException.id()).name, "System.DivideByZeroException");
        assert_eq!(md.class(WellKnown::UIntPtr.id()).name, "System.UIntPtr");
        assert!(md.is_subclass_of(
            WellKnown::OverflowException.id(),
            WellKnown::ArithmeticException.id()
        ));
    }

    #[test]
    fn test_field_layout() {
        let mut b = MetadataBuilder::new();
        let point = b.define_value_type("Point").unwrap();
        let x = b.add_field(point, "x", TypeDesc::I4, false);
        let flag = b.add_field(point, "flag", TypeDesc::Bool, false);
        let y = b.add_field(point, "y", TypeDesc::I8, false);
        let holder = b.define_class("Holder", None).unwrap();
        let p = b.add_field(holder, "p", TypeDesc::Class(point), false);
        let count = b.add_field(holder, "count", TypeDesc::I4, true);
        let md = b.finish().unwrap();

        assert_eq!(md.field(x).offset, 0);
        assert_eq!(md.field(flag).offset, 4);
        assert_eq!(md.field(y).offset, 8);
        assert_eq!(md.class(point).instance_size, 16);
        assert_eq!(md.field(p).offset, 0);
        assert_eq!(md.class(holder).instance_size, 16);
        assert_eq!(md.field(count).offset, 0);
        assert_eq!(md.class(holder).static_size, 8);
    }

    #[test]
    fn test_inherited_fields_follow_parent() {
        let md = MetadataBuilder::new().finish().unwrap();
        let message = md.find_field("System.OverflowException::_message").unwrap();
        assert_eq!(md.field(message).offset, 0);
        assert_eq!(md.class(WellKnown::OverflowException.id()).instance_size, 8);
    }

    #[test]
    fn test_newslot_does_not_override() {
        let mut b = MetadataBuilder::new();
        let a = b.define_class("A", None).unwrap();
        let bb = b.define_class("B", Some(a)).unwrap();
        let fa = b.add_method(a, MethodDef::instance("F", vec![], TypeDesc::Void).virtual_());
        let fb = b.add_method(bb, MethodDef::instance("F", vec![], TypeDesc::Void).virtual_().newslot());
        let md = b.finish().unwrap();
        assert_eq!(md.resolve_virtual(fa, bb), fa);
        assert_ne!(md.method(fa).slot, md.method(fb).slot);
    }

    #[test]
    fn test_duplicate_class() {
        let mut b = MetadataBuilder::new();
        b.define_class("A", None).unwrap();
        assert!(matches!(b.define_class("A", None), Err(LoadError::Duplicate(_))));
    }
}
