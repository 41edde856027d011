//! GPIB addresses and the operator address prompt.

use crate::config::MAX_GPIB_ADDRESS;
use crate::error::{CalError, CalResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;

/// Board and primary address of one instrument on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GpibAddress {
    /// GPIB board index
    pub board: u8,
    /// Primary address (0-30)
    pub primary: u8,
}

impl GpibAddress {
    /// Address on `board` at `primary`.
    pub fn new(board: u8, primary: u8) -> CalResult<Self> {
        if primary > MAX_GPIB_ADDRESS {
            return Err(CalError::InvalidAddress(format!(
                "primary address {primary} is outside 0-{MAX_GPIB_ADDRESS}"
            )));
        }
        Ok(Self { board, primary })
    }

    /// VISA resource string, e.g. `GPIB0::22::INSTR`.
    pub fn resource_string(&self) -> String {
        format!("GPIB{}::{}::INSTR", self.board, self.primary)
    }

    /// Parse operator input, using `board` for bare primary addresses.
    pub fn parse_on_board(input: &str, board: u8) -> CalResult<Self> {
        let input = input.trim();
        if let Ok(primary) = input.parse::<u8>() {
            return Self::new(board, primary);
        }

        let invalid = || CalError::InvalidAddress(format!("'{input}'"));
        let upper = input.to_ascii_uppercase();
        let rest = upper.strip_prefix("GPIB").ok_or_else(invalid)?;
        let mut parts = rest.split("::");
        let board_part = parts.next().ok_or_else(invalid)?;
        let primary_part = parts.next().ok_or_else(invalid)?;
        if parts.next() != Some("INSTR") || parts.next().is_some() {
            return Err(invalid());
        }
        let board = if board_part.is_empty() {
            0
        } else {
            board_part.parse::<u8>().map_err(|_| invalid())?
        };
        let primary = primary_part.parse::<u8>().map_err(|_| invalid())?;
        Self::new(board, primary)
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource_string())
    }
}

impl FromStr for GpibAddress {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_on_board(s, 0)
    }
}

/// Ask the operator for an address until a valid one is entered.
///
/// An empty line accepts `default`. Malformed input prints the problem and
/// asks again; end of input is reported as [`CalError::InvalidAddress`].
pub fn prompt_address<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
    default: GpibAddress,
) -> CalResult<GpibAddress> {
    loop {
        write!(output, "{label} address [{}]: ", default.primary)?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            return Err(CalError::InvalidAddress(format!(
                "no {label} address entered"
            )));
        }

        let line = line.trim();
        if line.is_empty() {
            return Ok(default);
        }
        match GpibAddress::parse_on_board(line, default.board) {
            Ok(address) => return Ok(address),
            Err(e) => writeln!(output, "{e}, try again")?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_address() -> GpibAddress {
        GpibAddress::new(0, 22).unwrap()
    }

    #[test]
    fn parses_bare_and_full_forms() {
        assert_eq!("22".parse::<GpibAddress>().unwrap(), default_address());
        assert_eq!(
            "GPIB1::4::INSTR".parse::<GpibAddress>().unwrap(),
            GpibAddress::new(1, 4).unwrap()
        );
        assert_eq!(
            "gpib::9::instr".parse::<GpibAddress>().unwrap(),
            GpibAddress::new(0, 9).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "abc", "31", "GPIB0::22", "GPIB0::x::INSTR", "TCPIP0::1::INSTR"] {
            assert!(bad.parse::<GpibAddress>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn displays_as_resource_string() {
        assert_eq!(default_address().to_string(), "GPIB0::22::INSTR");
    }

    #[test]
    fn prompt_accepts_default_on_empty_line() {
        let mut input = Cursor::new("\n");
        let mut output = Vec::new();
        let address = prompt_address(&mut input, &mut output, "HP", default_address()).unwrap();
        assert_eq!(address, default_address());
        assert!(String::from_utf8(output).unwrap().contains("HP address [22]"));
    }

    #[test]
    fn prompt_reprompts_after_malformed_input() {
        let mut input = Cursor::new("twenty\n99\n9\n");
        let mut output = Vec::new();
        let address = prompt_address(&mut input, &mut output, "Fluke", default_address()).unwrap();
        assert_eq!(address.primary, 9);

        let transcript = String::from_utf8(output).unwrap();
        assert_eq!(transcript.matches("Fluke address").count(), 3);
        assert_eq!(transcript.matches("try again").count(), 2);
    }

    #[test]
    fn prompt_reports_end_of_input() {
        let mut input = Cursor::new("bogus\n");
        let mut output = Vec::new();
        let result = prompt_address(&mut input, &mut output, "HP", default_address());
        assert!(matches!(result, Err(CalError::InvalidAddress(_))));
    }
}
