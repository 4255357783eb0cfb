//! Backend exit translation
//!
//! `RawExit` is backend vocabulary; `ExitReason` is nucleus vocabulary.
//! This is the single crossing point between the two, and it is total:
//! every raw variant maps to exactly one reason, with no wildcard arm.

use nvisor_backend::RawExit;
use nvisor_core::{ExitReason, Gpa};

/// Translate a backend exit into the core's exit reason.
pub fn translate_exit(raw: RawExit) -> ExitReason {
    match raw {
        RawExit::Hvc { nr, args } => ExitReason::Hypercall { nr, args },
        RawExit::DataAbort { gpa, write } => ExitReason::MemoryFault {
            gpa: Gpa(gpa),
            write,
        },
        RawExit::PrefetchAbort { gpa } => ExitReason::InstructionAbort { gpa: Gpa(gpa) },
        RawExit::SysReg { reg, write } => ExitReason::SysRegAccess { reg, write },
        RawExit::Wfi => ExitReason::WaitForInterrupt,
        RawExit::Exception { vector } => ExitReason::Exception { vector },
        RawExit::Cancelled => ExitReason::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_raw_exit_translates() {
        let raws = [
            RawExit::Hvc { nr: 3, args: [1, 2, 3, 4, 5, 6] },
            RawExit::DataAbort { gpa: 0x2000, write: true },
            RawExit::PrefetchAbort { gpa: 0x3000 },
            RawExit::SysReg { reg: 7, write: false },
            RawExit::Wfi,
            RawExit::Exception { vector: 11 },
            RawExit::Cancelled,
        ];
        let expected = [
            ExitReason::Hypercall { nr: 3, args: [1, 2, 3, 4, 5, 6] },
            ExitReason::MemoryFault { gpa: Gpa(0x2000), write: true },
            ExitReason::InstructionAbort { gpa: Gpa(0x3000) },
            ExitReason::SysRegAccess { reg: 7, write: false },
            ExitReason::WaitForInterrupt,
            ExitReason::Exception { vector: 11 },
            ExitReason::Cancelled,
        ];

        for (raw, reason) in raws.into_iter().zip(expected) {
            assert_eq!(translate_exit(raw), reason);
        }
    }
}
