use iottymux::front::Front;
use std::process;

fn main() {
    if let Err(err) = Front::run() {
        eprintln!("iottymux-attach: {err:#}");
        process::exit(254);
    }
}
