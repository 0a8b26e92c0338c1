use std::fmt;
use std::str::FromStr;

/// Names of the general purpose registers in x86-64 encoding order.
pub const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// 32-bit aliases of the first eight general purpose registers.
const GPR32_NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];

/// CPU register which can be read, written and flipped through a probe context.
///
/// Only full-width registers are modelled. Partial aliases like `eax` or `r9d`
/// resolve to their full register, which is also what a flip on the partial
/// register would corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// General purpose register, numbered in encoding order (0 = rax, 15 = r15)
    Gpr(u8),
    Rip,
    Xmm(u8),
    Ymm(u8),
}

impl Register {
    pub const RAX: Register = Register::Gpr(0);
    pub const RSP: Register = Register::Gpr(4);
    pub const RDI: Register = Register::Gpr(7);

    /// Size of the register in bytes
    pub fn width(&self) -> usize {
        match self {
            Register::Gpr(_) | Register::Rip => 8,
            Register::Xmm(_) => 16,
            Register::Ymm(_) => 32,
        }
    }

    /// Number of bit positions a flip can target
    pub fn bits(&self) -> u32 {
        self.width() as u32 * 8
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Register::Gpr(number) => write!(f, "{}", GPR_NAMES[*number as usize & 0xf]),
            Register::Rip => write!(f, "rip"),
            Register::Xmm(number) => write!(f, "xmm{number}"),
            Register::Ymm(number) => write!(f, "ymm{number}"),
        }
    }
}

fn vector_number(name: &str, prefix: &str) -> Option<u8> {
    let number = name.strip_prefix(prefix)?.parse::<u8>().ok()?;
    (number < 16).then_some(number)
}

impl FromStr for Register {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        if name == "rip" {
            return Ok(Register::Rip);
        }
        if let Some(number) = GPR_NAMES.iter().position(|gpr| *gpr == name) {
            return Ok(Register::Gpr(number as u8));
        }
        if let Some(number) = GPR32_NAMES.iter().position(|gpr| *gpr == name) {
            return Ok(Register::Gpr(number as u8));
        }
        // r8d .. r15d, r8w, r8b
        if let Some(number) = name
            .strip_prefix('r')
            .map(|rest| rest.trim_end_matches(['d', 'w', 'b']))
            .and_then(|rest| rest.parse::<u8>().ok())
            .filter(|number| (8..16).contains(number))
        {
            return Ok(Register::Gpr(number));
        }
        if let Some(number) = vector_number(&name, "xmm") {
            return Ok(Register::Xmm(number));
        }
        if let Some(number) = vector_number(&name, "ymm") {
            return Ok(Register::Ymm(number));
        }
        Err(format!("Unknown register '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_register_names() {
        assert_eq!("rax".parse::<Register>(), Ok(Register::RAX));
        assert_eq!("EAX".parse::<Register>(), Ok(Register::RAX));
        assert_eq!("r9d".parse::<Register>(), Ok(Register::Gpr(9)));
        assert_eq!("rdi".parse::<Register>(), Ok(Register::RDI));
        assert_eq!("xmm15".parse::<Register>(), Ok(Register::Xmm(15)));
        assert_eq!("ymm0".parse::<Register>(), Ok(Register::Ymm(0)));
        assert!("xmm16".parse::<Register>().is_err());
        assert!("r16".parse::<Register>().is_err());
        assert!("cr0".parse::<Register>().is_err());
    }

    #[test]
    fn register_widths() {
        assert_eq!(Register::RSP.bits(), 64);
        assert_eq!(Register::Xmm(3).width(), 16);
        assert_eq!(Register::Ymm(3).bits(), 256);
        assert_eq!(Register::Gpr(12).to_string(), "r12");
    }
}
