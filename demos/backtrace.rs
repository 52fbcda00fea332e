use leakwatch::symbols::SymbolCache;
use leakwatch::symbols::demangle::UNAVAILABLE_FUNCTION;
use leakwatch::symbols::SymbolSearchPath;
use leakwatch::{BacktraceSymbolizer, CallStack, Capturer};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let symbols = SymbolCache::new(Box::new(BacktraceSymbolizer));
    symbols.initialize(&SymbolSearchPath::build())?;
    println!("Symbol search path: {}", SymbolSearchPath::build());

    let call_stack = a();
    for &pc in call_stack.frames() {
        let frame = symbols.resolve(pc);
        match frame.symbols.first() {
            Some(symbol) => println!(
                "{pc:#x} {}:{} {}",
                symbol
                    .file
                    .as_deref()
                    .map(|file| file.display().to_string())
                    .unwrap_or_else(|| "(unavailable)".to_string()),
                symbol.line.unwrap_or_default(),
                symbol.name.as_deref().unwrap_or(UNAVAILABLE_FUNCTION),
            ),
            None => println!("{pc:#x} {UNAVAILABLE_FUNCTION}"),
        }
    }

    Ok(())
}

#[inline(never)]
fn a() -> CallStack {
    b()
}

#[inline(never)]
fn b() -> CallStack {
    c()
}

#[inline(never)]
fn c() -> CallStack {
    // frame 0 is the caller of capture, which is this function
    let call_stack = Capturer::default().capture(16);
    std::hint::black_box(call_stack)
}
