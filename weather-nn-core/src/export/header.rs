use std::fmt::{self, Write};

/// Render `bytes` as a C source fragment that firmware can compile in.
pub fn c_header(bytes: &[u8], symbol: &str) -> Result<String, fmt::Error> {
    let mut out = String::with_capacity(bytes.len() * 6 + 256);
    write_c_array(&mut out, bytes, symbol)?;
    Ok(out)
}

fn write_c_array<W: Write>(out: &mut W, bytes: &[u8], symbol: &str) -> fmt::Result {
    let guard = format!("{}_H", symbol.to_ascii_uppercase());
    writeln!(out, "#ifndef {guard}")?;
    writeln!(out, "#define {guard}\n")?;
    writeln!(out, "const unsigned char {symbol}[] = {{")?;
    for line in bytes.chunks(12) {
        out.write_str(" ")?;
        for b in line {
            write!(out, " 0x{b:02x},")?;
        }
        out.write_char('\n')?;
    }
    writeln!(out, "}};")?;
    writeln!(out, "const unsigned int {symbol}_len = {};\n", bytes.len())?;
    writeln!(out, "#endif  // {guard}")
}

/// C identifier derived from a file stem.
pub fn symbol_name(stem: &str) -> String {
    let mut symbol: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if symbol.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        symbol.insert(0, '_');
    }
    symbol
}
