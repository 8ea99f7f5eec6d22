use std::io::Write as _;

#[rquickjs::module(rename_vars = "camelCase", rename_types = "camelCase")]
#[allow(clippy::module_inception)]
pub mod io {
    use super::*;

    #[rquickjs::function]
    pub fn print(txt: String) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(txt.as_bytes());
        flush();
    }

    #[rquickjs::function]
    pub fn flush() {
        let _ = std::io::stdout().flush();
    }
}
