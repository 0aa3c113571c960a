use std::path::PathBuf;

use clap::{error::ErrorKind, CommandFactory, Parser as ClapParser};
use colored::Colorize;

use rillc::{
    backend::{
        ast_lowering::LoweringContext, cfg::build_cfg, liveness, pretty_print,
        regalloc::linear_scan_allocate,
    },
    frontend::{parser::Parser, SourceFile, SourceFileOrigin},
    middle::{fold::fold_module, resolve::Resolver},
    runtime::{builtins::Registry, vm::Vm},
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    source_file: PathBuf,

    /// Print the parse tree
    #[arg(long)]
    dump_ast: bool,

    /// Print the flat IR after lowering
    #[arg(long)]
    dump_ir: bool,

    /// Print the basic blocks and edges after optimization
    #[arg(long)]
    dump_cfg: bool,

    /// Print the register-assigned instruction stream
    #[arg(long)]
    dump_alloc: bool,

    /// Skip the CFG optimization stage
    #[arg(long)]
    no_opt: bool,

    /// Size of the physical register bank
    #[arg(long, default_value_t = 16)]
    regs: usize,
}

fn main() {
    let args = Args::parse();

    if !args.source_file.exists() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!(
                    "Source file '{}' does not exist!",
                    args.source_file.display()
                ),
            )
            .exit()
    }

    if !args.source_file.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!(
                    "Input path '{}' is not a file!",
                    args.source_file.display()
                ),
            )
            .exit()
    }

    let contents = std::fs::read_to_string(&args.source_file)
        .expect("Failed to read input file (or invalid UTF-8)");

    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(args.source_file),
    };

    let builtins = Registry::new();

    let module = Parser::parse_module(&source);

    if args.dump_ast {
        println!("{module:#?}");
    }

    let resolutions = match Resolver::resolve_module(&module, &source, &builtins) {
        Ok(resolutions) => resolutions,
        Err(error) => {
            eprintln!("{} {error}", "error:".red().bold());
            std::process::exit(1);
        }
    };

    let module = fold_module(module);

    let ir = LoweringContext::lower_module(&module, &resolutions, &builtins);

    if args.dump_ir {
        print!("{}", pretty_print::ir_listing(&ir.code));
    }

    let code = if args.no_opt {
        ir.code
    } else {
        let mut cfg = build_cfg(&ir.code);
        liveness::optimize(&mut cfg);

        if args.dump_cfg {
            print!("{}", pretty_print::cfg_listing(&cfg));
        }

        cfg.flatten()
    };

    let allocated = linear_scan_allocate(&code, args.regs);

    if args.dump_alloc {
        print!("{}", pretty_print::ir_listing(&allocated));
    }

    let mut vm = Vm::new(args.regs, &builtins);

    if let Err(fault) = vm.run(&allocated) {
        eprintln!("{} {fault}", "error:".red().bold());
        std::process::exit(1);
    }
}
