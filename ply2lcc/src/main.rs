use std::path::PathBuf;
use std::sync::Arc;

use lcc_lib::convert::Converter;
use lcc_lib::types::ConvertConfig;
use lcc_lib::LccError;

fn print_usage(program: &str) {
    eprintln!(
        "Usage: {program} -i <input.ply> -o <output_dir> [options]\n\
         \n\
         Options:\n\
         \x20 -e <path>          Include environment splats from the specified .ply file\n\
         \x20 -m <path>          Include collision mesh from the specified .ply or .obj file\n\
         \x20 --single-lod       Use only LOD0 even if more LOD files exist\n\
         \x20 --cell-size X,Y    Grid cell size in meters (default: 30,30)\n\
         \x20 -h, --help         Print this help"
    );
}

fn parse_cell_size(value: &str) -> Result<(f32, f32), LccError> {
    let invalid = || LccError::InvalidArgument("invalid cell-size format, use X,Y".into());
    let (x, y) = value.split_once(',').ok_or_else(invalid)?;
    let x = x.trim().parse::<f32>().map_err(|_| invalid())?;
    let y = y.trim().parse::<f32>().map_err(|_| invalid())?;
    Ok((x, y))
}

fn flag_value<'a>(args: &'a [String], i: usize) -> Result<&'a String, LccError> {
    args.get(i + 1)
        .ok_or_else(|| LccError::InvalidArgument(format!("missing value for {}", args[i])))
}

fn parse_args(args: &[String]) -> Result<ConvertConfig, LccError> {
    let mut config = ConvertConfig::default();

    let mut i = 0;
    while i < args.len() {
        let value = |i: usize| flag_value(args, i);

        match args[i].as_str() {
            "-i" => {
                config.input_path = PathBuf::from(value(i)?);
                i += 1;
            }
            "-o" => {
                config.output_dir = PathBuf::from(value(i)?);
                i += 1;
            }
            "-e" => {
                config.env_path = Some(PathBuf::from(value(i)?));
                config.include_env = true;
                i += 1;
            }
            "-m" => {
                config.collision_path = Some(PathBuf::from(value(i)?));
                config.include_collision = true;
                i += 1;
            }
            "--single-lod" => config.single_lod = true,
            "--cell-size" => {
                let (x, y) = parse_cell_size(value(i)?)?;
                config.cell_size_x = x;
                config.cell_size_y = y;
                i += 1;
            }
            "-h" | "--help" => {
                print_usage("ply2lcc");
                std::process::exit(0);
            }
            other => {
                return Err(LccError::InvalidArgument(format!(
                    "unknown argument: {other}"
                )))
            }
        }
        i += 1;
    }

    if config.input_path.as_os_str().is_empty() || config.output_dir.as_os_str().is_empty() {
        print_usage("ply2lcc");
        return Err(LccError::InvalidArgument(
            "missing required arguments: -i and -o".into(),
        ));
    }

    Ok(config)
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = parse_args(&args)?;

    let mut converter = Converter::new(config);
    converter.set_log(Arc::new(|msg: &str| print!("{msg}")));
    converter.run()?;
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_full_command_line() {
        let config = parse_args(&args(&[
            "-i",
            "scene.ply",
            "-o",
            "out",
            "-e",
            "env.ply",
            "-m",
            "mesh.obj",
            "--single-lod",
            "--cell-size",
            "10,20",
        ]))
        .unwrap();

        assert_eq!(config.input_path, PathBuf::from("scene.ply"));
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert!(config.include_env);
        assert_eq!(config.env_path, Some(PathBuf::from("env.ply")));
        assert!(config.include_collision);
        assert!(config.single_lod);
        assert_eq!(config.cell_size_x, 10.0);
        assert_eq!(config.cell_size_y, 20.0);
    }

    #[test]
    fn rejects_missing_required_arguments() {
        let err = parse_args(&args(&["-i", "scene.ply"])).unwrap_err();
        assert!(matches!(err, LccError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_malformed_cell_size() {
        assert!(parse_cell_size("30").is_err());
        assert!(parse_cell_size("a,b").is_err());
        assert_eq!(parse_cell_size("30, 45.5").unwrap(), (30.0, 45.5));
    }
}
