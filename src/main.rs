use std::env;

mod demo;
mod error;
mod layer;
mod optimization;
mod tree;

fn main() {
    env_logger::init();
    println!("Hello Canopy world!");
    let args = env::args().collect::<Vec<_>>();

    let instructions = "pass `--demo` to train a small tree-softmax classifier on synthetic data";

    if args.len() <= 1 {
        println!("{}", instructions);
        return;
    }

    match args[1].as_str() {
        "--demo" => {
            demo::demo();
        }
        _ => {
            println!("{}", instructions);
        }
    }
}
