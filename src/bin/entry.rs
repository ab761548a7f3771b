use iottymux::entry::Entry;
use std::process;

fn main() {
    if let Err(err) = Entry::run() {
        eprintln!("iottymux-entry: {err:#}");
        process::exit(254);
    }
}
