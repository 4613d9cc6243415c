use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use slv_avatar::assets::texture::{save_rgba, TextureData};
use slv_avatar::assets::MeshData;
use slv_avatar::avatar::{AvatarLibrary, BakeRegion, MorphDeltaSet};
use slv_avatar::config::{load_settings, AvatarSettings};
use slv_avatar::utils::logging::init_logging;
use slv_avatar::utils::math::parsing::parse_assignment;
use slv_avatar::world::Avatar;

#[derive(Parser)]
#[command(name = "slv-avatar", version, about = "Inspect, deform and bake avatar assets")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print statistics for a standalone morph block
    InspectMorph {
        file: PathBuf,
    },
    /// Write a mesh with parameter weights applied as Wavefront OBJ
    ExportObj {
        /// Avatar definition XML
        #[arg(long)]
        definition: PathBuf,
        /// Mesh type, e.g. upperBodyMesh
        #[arg(long)]
        mesh: String,
        /// Parameter weight as NAME=WEIGHT, repeatable
        #[arg(long = "param", value_name = "NAME=WEIGHT")]
        params: Vec<String>,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Derive a morph block from an edited OBJ of the base mesh
    RebaseMorph {
        #[arg(long)]
        definition: PathBuf,
        #[arg(long)]
        mesh: String,
        /// Morph name to write
        #[arg(long)]
        morph: String,
        /// Edited OBJ with the same vertex order as the base mesh
        #[arg(long)]
        obj: PathBuf,
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Composite one body region to a PNG
    Bake {
        #[arg(long)]
        definition: PathBuf,
        /// head, upper_body, lower_body, eyes, skirt or hair
        #[arg(long)]
        region: String,
        /// Texture slot assignment as SLOT=PATH, repeatable
        #[arg(long = "texture", value_name = "SLOT=PATH")]
        textures: Vec<String>,
        /// Parameter weight as NAME=WEIGHT, repeatable
        #[arg(long = "param", value_name = "NAME=WEIGHT")]
        params: Vec<String>,
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn load_avatar(definition: &Path, settings: &AvatarSettings) -> Result<(AvatarLibrary, Avatar)> {
    let library = AvatarLibrary::load(definition, &settings.deformation)
        .with_context(|| format!("Failed to load avatar definition {}", definition.display()))?;
    let avatar = Avatar::new(Uuid::new_v4(), "cli", &library, settings);
    Ok((library, avatar))
}

fn apply_weights(avatar: &mut Avatar, params: &[String]) -> Result<()> {
    for param in params {
        let (name, value) = parse_assignment(param).map_err(|e| anyhow!(e))?;
        let weight: f32 = value
            .parse()
            .with_context(|| format!("Invalid weight for '{}'", name))?;
        avatar.set_param_weight_by_name(name, weight)?;
    }
    Ok(())
}

fn inspect_morph(file: &Path) -> Result<()> {
    let name = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut reader = BufReader::new(File::open(file).with_context(|| format!("Failed to open {}", file.display()))?);
    let morph = MorphDeltaSet::load(&name, "", &mut reader)?;
    println!("morph:            {}", morph.name());
    println!("records:          {}", morph.len());
    println!("total distortion: {:.6}", morph.total_distortion());
    println!("max distortion:   {:.6}", morph.max_distortion());
    let avg = morph.avg_distortion();
    println!("avg direction:    {:.4} {:.4} {:.4}", avg.x, avg.y, avg.z);
    Ok(())
}

fn export_obj(definition: &Path, mesh: &str, params: &[String], output: &Path, settings: &AvatarSettings) -> Result<()> {
    let (_library, mut avatar) = load_avatar(definition, settings)?;
    apply_weights(&mut avatar, params)?;
    avatar.update();
    let mut writer = BufWriter::new(File::create(output)?);
    avatar.export_obj(mesh, &mut writer)?;
    writer.flush()?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn rebase_morph(
    definition: &Path,
    mesh: &str,
    morph: &str,
    obj: &Path,
    output: &Path,
    settings: &AvatarSettings,
) -> Result<()> {
    let (library, _) = load_avatar(definition, settings)?;
    let base = library
        .mesh(mesh)
        .ok_or_else(|| anyhow!("Definition has no loadable mesh '{}'", mesh))?;
    let authored = MeshData::authored_from_obj(&base, BufReader::new(File::open(obj)?))
        .with_context(|| format!("Failed to read {}", obj.display()))?;
    let data = MorphDeltaSet::from_mesh_difference(morph, &base, &authored, settings.deformation.significant_delta)?;
    let mut writer = BufWriter::new(File::create(output)?);
    data.save(&mut writer)?;
    writer.flush()?;
    println!("{}: {} vertices changed", morph, data.len());
    Ok(())
}

fn bake(
    definition: &Path,
    region: &str,
    textures: &[String],
    params: &[String],
    output: &Path,
    settings: &AvatarSettings,
) -> Result<()> {
    let region = BakeRegion::parse(region).ok_or_else(|| anyhow!("Unknown body region '{}'", region))?;
    let (_library, mut avatar) = load_avatar(definition, settings)?;
    apply_weights(&mut avatar, params)?;
    for assignment in textures {
        let (slot, path) = parse_assignment(assignment).map_err(|e| anyhow!(e))?;
        let data = TextureData::open(Path::new(path)).with_context(|| format!("Failed to load '{}'", path))?;
        let id = Uuid::new_v4();
        avatar.set_local_texture(slot, Some(id));
        avatar.on_texture_data_available(region, id, Arc::new(data));
    }
    avatar.update();

    let appearance = avatar.appearance();
    let Some(baked) = appearance.baked(region) else {
        // Surface the reason the bake did not complete
        appearance.composite(region)?;
        bail!("Nothing to bake for {}", region);
    };
    save_rgba(output, baked.width, baked.height, baked.pixels.to_vec())?;
    println!("Baked {} ({}x{}) to {}", region, baked.width, baked.height, output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings();
    init_logging(&settings.logging);

    match cli.command {
        Command::InspectMorph { file } => inspect_morph(&file),
        Command::ExportObj { definition, mesh, params, output } => {
            export_obj(&definition, &mesh, &params, &output, &settings)
        }
        Command::RebaseMorph { definition, mesh, morph, obj, output } => {
            rebase_morph(&definition, &mesh, &morph, &obj, &output, &settings)
        }
        Command::Bake { definition, region, textures, params, output } => {
            bake(&definition, &region, &textures, &params, &output, &settings)
        }
    }
}
