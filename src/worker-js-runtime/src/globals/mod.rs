use rquickjs::Ctx;

mod console;
mod print;
mod require;
mod string;
mod timers;
mod webapi;

/// Installs the global surface a worker module sees, in a fixed order: each
/// step may assume the previous ones already ran.
pub fn setup(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    string::setup(ctx)?;
    print::setup(ctx)?;
    console::setup(ctx)?;
    require::setup(ctx)?;
    timers::setup(ctx)?;
    webapi::setup(ctx)?;
    Ok(())
}
