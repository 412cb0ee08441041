/*!
Command handlers for the CLI

- `serve`   : run the HTTP API and event stream server
- `generate`: stream one generation into a chapter from the terminal
- `content` : create and print chapter documents
- `history` : inspect finished sessions
*/

pub mod content;
pub mod generate;
pub mod history;
pub mod serve;

pub use content::handle_content;
pub use generate::{run_generate, GenerateOptions};
pub use history::handle_history;
pub use serve::run_serve;
