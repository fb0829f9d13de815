//! Typed host-to-guest calls.

use std::fmt;
use std::marker::PhantomData;

use armada_guest::{LINK_REGISTER, ThreadState};
use armada_jit::ArgLayout;
use armada_jit::marshal::{ArgList, ReturnValue};

use crate::error::ExecError;
use crate::translator::Translator;

/// A guest function at a fixed address, callable with Rust values.
///
/// Arguments go to X0..X7 / V0..V7 per AAPCS64, the link register is set to
/// 0 so the guest's return hands control back to the host, and the result is
/// read from X0 or V0.
pub struct GuestFunction<Args, Ret> {
    address: u64,
    layout: ArgLayout,
    _signature: PhantomData<fn(Args) -> Ret>,
}

impl<Args, Ret> fmt::Debug for GuestFunction<Args, Ret> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestFunction")
            .field("address", &format_args!("{:#x}", self.address))
            .field("layout", &self.layout)
            .finish()
    }
}

impl<Args: ArgList, Ret: ReturnValue> GuestFunction<Args, Ret> {
    /// Bind the guest function at `address`.
    pub fn new(address: u64) -> Result<Self, ExecError> {
        Ok(Self {
            address,
            layout: ArgLayout::new(&Args::classes())?,
            _signature: PhantomData,
        })
    }

    /// Guest entry address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Run the function on `state` and return its result.
    ///
    /// If the thread is stopped before the guest returns, the value in the
    /// result register at that point is returned.
    pub fn call(&self, translator: &Translator, state: &mut ThreadState, args: Args) -> Result<Ret, ExecError> {
        args.write(&mut state.regs, &self.layout);
        state.set_x(LINK_REGISTER as usize, 0);
        translator.execute(state, self.address)?;
        Ok(Ret::load(&state.regs))
    }
}
