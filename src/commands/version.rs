use clap::Args;

#[derive(Args, Debug)]
pub struct VersionArgs {}

pub fn run(_args: &VersionArgs) -> i32 {
    println!("restorable {}", env!("CARGO_PKG_VERSION"));
    crate::error::EXIT_SUCCESS
}
