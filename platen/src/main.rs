use clap::Parser;

use platen::{
    DEFAULT_INITIAL_SIZE, DEFAULT_MAX_SIZE, MemoryCreateInfo, Object, Vm, VmCreateInfo,
};

#[derive(Parser, Debug)]
#[command(about = "stack machine demo: operators and cooperative contexts")]
struct Args {
    /// initial arena size in bytes
    #[arg(long, default_value_t = DEFAULT_INITIAL_SIZE)]
    memory: usize,
    /// arena growth ceiling in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE)]
    memory_limit: usize,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let vm = Vm::new(&VmCreateInfo {
        memory: MemoryCreateInfo {
            initial_size: Some(args.memory),
            max_size: Some(args.memory_limit),
        },
    });

    let shuffle = vm
        .fork(&[], |ctx| {
            for value in [2, 12, 0xF00] {
                ctx.push(Object::integer(value))?;
            }
            ctx.push(Object::integer(3))?;
            ctx.push(Object::integer(1))?;
            ctx.invoke("roll")
        })
        .expect("fork shuffle context");
    let results = vm.join(shuffle).expect("shuffle context terminates");
    print!("roll:");
    for object in &results {
        print!(" {object}");
    }
    println!();

    let sum = vm
        .fork(&[Object::integer(40), Object::integer(2)], |ctx| {
            ctx.invoke("add")
        })
        .expect("fork add context");
    let results = vm.join(sum).expect("add context terminates");
    println!("add: {}", results[0]);

    let lock = vm.new_lock();
    let condition = vm.new_condition();
    let waiter = vm
        .fork(&[], move |ctx| {
            ctx.monitor(lock, |ctx| {
                ctx.wait(lock, condition)?;
                ctx.push(Object::boolean(true))
            })
        })
        .expect("fork waiter context");
    let notifier = vm
        .fork(&[], move |ctx| {
            ctx.monitor(lock, |ctx| ctx.notify(condition))
        })
        .expect("fork notifier context");
    vm.join(notifier).expect("notifier terminates");
    let woken = vm.join(waiter).expect("waiter terminates");
    println!("handoff: {}", woken[0]);
}
