//! Host function thunks.
//!
//! [`marshal_thunk`] wraps a Rust closure as a [`TranslatedSubroutine`] that
//! reads its arguments from the guest registers the AAPCS64 calling
//! convention assigns them to, writes the result to X0 or V0 and returns to
//! the address in the link register. Publishing the thunk at a guest address
//! makes guest calls to that address land in host code.

use std::marker::PhantomData;
use std::sync::Arc;

use armada_guest::{LINK_REGISTER, Register, RegisterClass, RegisterFile, V128};

use crate::backend::CompiledCode;
use crate::context::JitContext;
use crate::subroutine::TranslatedSubroutine;

/// Argument registers available per class.
pub const MAX_REGISTER_ARGS: usize = 8;

/// Errors building a marshalling layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    /// More arguments of one class than argument registers.
    #[error("{count} {class:?} arguments do not fit in {MAX_REGISTER_ARGS} registers")]
    TooManyArguments {
        /// Register class that overflowed.
        class: RegisterClass,
        /// Arguments of that class requested.
        count: usize,
    },
}

mod sealed {
    pub trait Sealed {}
}

/// A value that travels in a single guest register.
pub trait PlainValue: sealed::Sealed + Copy + Send + Sync + 'static {
    /// Register class carrying the value.
    const CLASS: RegisterClass;

    /// Register bits for this value.
    fn to_bits(self) -> u128;

    /// Value from register bits; extra high bits are ignored.
    fn from_bits(bits: u128) -> Self;
}

macro_rules! integer_values {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}

        impl PlainValue for $ty {
            const CLASS: RegisterClass = RegisterClass::Integer;

            fn to_bits(self) -> u128 {
                self as u64 as u128
            }

            fn from_bits(bits: u128) -> Self {
                bits as u64 as $ty
            }
        }
    )*};
}

integer_values!(u8, u16, u32, u64, i8, i16, i32, i64);

impl sealed::Sealed for bool {}

impl PlainValue for bool {
    const CLASS: RegisterClass = RegisterClass::Integer;

    fn to_bits(self) -> u128 {
        self as u128
    }

    fn from_bits(bits: u128) -> Self {
        bits as u8 != 0
    }
}

impl sealed::Sealed for f32 {}

impl PlainValue for f32 {
    const CLASS: RegisterClass = RegisterClass::Vector;

    fn to_bits(self) -> u128 {
        f32::to_bits(self) as u128
    }

    fn from_bits(bits: u128) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl sealed::Sealed for f64 {}

impl PlainValue for f64 {
    const CLASS: RegisterClass = RegisterClass::Vector;

    fn to_bits(self) -> u128 {
        f64::to_bits(self) as u128
    }

    fn from_bits(bits: u128) -> Self {
        f64::from_bits(bits as u64)
    }
}

impl sealed::Sealed for V128 {}

impl PlainValue for V128 {
    const CLASS: RegisterClass = RegisterClass::Vector;

    fn to_bits(self) -> u128 {
        self.0
    }

    fn from_bits(bits: u128) -> Self {
        V128(bits)
    }
}

/// A function result: nothing, or one [`PlainValue`] in X0/V0.
pub trait ReturnValue: Sized + Send + 'static {
    /// Write the result to the return register.
    fn store(self, regs: &mut RegisterFile);

    /// Read a result left by guest code.
    fn load(regs: &RegisterFile) -> Self;
}

impl ReturnValue for () {
    fn store(self, _regs: &mut RegisterFile) {}

    fn load(_regs: &RegisterFile) -> Self {}
}

impl<T: PlainValue> ReturnValue for T {
    fn store(self, regs: &mut RegisterFile) {
        regs.write_bits(Register::new(0, T::CLASS), self.to_bits());
    }

    fn load(regs: &RegisterFile) -> Self {
        T::from_bits(regs.read_bits(Register::new(0, T::CLASS)))
    }
}

/// Argument registers for a parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgLayout {
    registers: Vec<Register>,
}

impl ArgLayout {
    /// Assign X0..X7 to integer arguments and V0..V7 to vector arguments, in
    /// order. Stack-passed arguments are not supported.
    pub fn new(classes: &[RegisterClass]) -> Result<Self, MarshalError> {
        let mut next_integer = 0usize;
        let mut next_vector = 0usize;
        let mut registers = Vec::with_capacity(classes.len());
        for &class in classes {
            let (class, next) = match class {
                RegisterClass::Vector => (RegisterClass::Vector, &mut next_vector),
                RegisterClass::Integer | RegisterClass::Flag => (RegisterClass::Integer, &mut next_integer),
            };
            *next += 1;
            if *next > MAX_REGISTER_ARGS {
                let count = classes
                    .iter()
                    .filter(|&&c| (c == RegisterClass::Vector) == (class == RegisterClass::Vector))
                    .count();
                return Err(MarshalError::TooManyArguments { class, count });
            }
            registers.push(Register::new((*next - 1) as u8, class));
        }
        Ok(Self { registers })
    }

    /// Register per argument, in argument order.
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }
}

/// A tuple of [`PlainValue`] arguments.
pub trait ArgList: Sized + Send + 'static {
    /// Register class of each argument.
    fn classes() -> Vec<RegisterClass>;

    /// Read the arguments from `layout`'s registers.
    fn read(regs: &RegisterFile, layout: &ArgLayout) -> Self;

    /// Write the arguments to `layout`'s registers.
    fn write(self, regs: &mut RegisterFile, layout: &ArgLayout);
}

/// A host callable taking `Args`.
pub trait HostFunction<Args>: Send + Sync + 'static {
    /// Result type.
    type Output: ReturnValue;

    /// Call with unpacked arguments.
    fn call(&self, args: Args) -> Self::Output;
}

macro_rules! arg_lists {
    ($( ($($name:ident $idx:tt),*) )*) => {$(
        impl<$($name: PlainValue),*> ArgList for ($($name,)*) {
            fn classes() -> Vec<RegisterClass> {
                vec![$($name::CLASS),*]
            }

            #[allow(unused_variables)]
            fn read(regs: &RegisterFile, layout: &ArgLayout) -> Self {
                ($($name::from_bits(regs.read_bits(layout.registers[$idx])),)*)
            }

            #[allow(unused_variables)]
            fn write(self, regs: &mut RegisterFile, layout: &ArgLayout) {
                $(regs.write_bits(layout.registers[$idx], self.$idx.to_bits());)*
            }
        }

        impl<Func, Ret, $($name: PlainValue),*> HostFunction<($($name,)*)> for Func
        where
            Func: Fn($($name),*) -> Ret + Send + Sync + 'static,
            Ret: ReturnValue,
        {
            type Output = Ret;

            #[allow(non_snake_case)]
            fn call(&self, args: ($($name,)*)) -> Ret {
                let ($($name,)*) = args;
                self($($name),*)
            }
        }
    )*};
}

arg_lists! {
    ()
    (A 0)
    (A 0, B 1)
    (A 0, B 1, C 2)
    (A 0, B 1, C 2, D 3)
    (A 0, B 1, C 2, D 3, E 4)
    (A 0, B 1, C 2, D 3, E 4, F 5)
    (A 0, B 1, C 2, D 3, E 4, F 5, G 6)
    (A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7)
}

struct HostThunk<Args, F> {
    layout: ArgLayout,
    function: F,
    _args: PhantomData<fn(Args)>,
}

impl<Args, F> CompiledCode for HostThunk<Args, F>
where
    Args: ArgList,
    F: HostFunction<Args>,
{
    fn invoke(&self, ctx: &mut JitContext<'_>, _args: &[u64]) -> u64 {
        let args = Args::read(ctx.regs(), &self.layout);
        self.function.call(args).store(ctx.regs_mut());
        ctx.regs().x[LINK_REGISTER as usize]
    }
}

/// Wrap `function` as a subroutine entered at `address`.
///
/// The result is a Tier1 entry that never asks to be rebuilt.
pub fn marshal_thunk<Args, F>(
    address: u64,
    name: impl Into<String>,
    function: F,
) -> Result<TranslatedSubroutine, MarshalError>
where
    Args: ArgList,
    F: HostFunction<Args>,
{
    let layout = ArgLayout::new(&Args::classes())?;
    let mut params = layout.registers().to_vec();
    params.push(Register::int(LINK_REGISTER));
    let name = name.into();
    tracing::debug!(address, name = %name, args = layout.registers().len(), "marshalled host function");
    let thunk = HostThunk {
        layout,
        function,
        _args: PhantomData,
    };
    Ok(TranslatedSubroutine::host(address, name, params, Arc::new(thunk)))
}
