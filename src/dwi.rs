//! Diffusion preprocessing chain built on the Anima tools.
//!
//! Intermediate images go to `<input dir>/tmp/`; final products sit next to
//! the input and share its prefix (`<prefix>_Tensors.nii.gz`, `<prefix>_FA.nii.gz`...).

use std::path::{Path, PathBuf};

use crate::config::Toolchain;
use crate::error::BidsError;
use crate::pipeline::{Invocation, Pipeline, Step};

const BRAIN_EXTRACTION_SCRIPT: &str = "brain_extraction/animaAtlasBasedBrainExtraction.py";

#[derive(Debug, Clone)]
pub struct DwiOptions {
    pub input: PathBuf,
    pub bval: PathBuf,
    pub grad: Option<PathBuf>,
    pub reverse: Option<PathBuf>,
    /// Phase encoding direction: 0 x, 1 y, 2 z.
    pub direction: u8,
    pub t1: Option<PathBuf>,
    pub no_eddy_correction: bool,
    pub no_disto_correction: bool,
    pub no_denoising: bool,
    pub no_brain_masking: bool,
    pub python: PathBuf,
}

impl DwiOptions {
    pub fn new(input: PathBuf, bval: PathBuf) -> Self {
        Self {
            input,
            bval,
            grad: None,
            reverse: None,
            direction: 1,
            t1: None,
            no_eddy_correction: false,
            no_disto_correction: false,
            no_denoising: false,
            no_brain_masking: false,
            python: PathBuf::from("python"),
        }
    }
}

/// Strips `.nii.gz` (or any single extension) from an image path.
pub fn image_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(stripped) = text.strip_suffix(".gz") {
        let inner = PathBuf::from(stripped);
        return inner.with_extension("");
    }
    path.with_extension("")
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut text = prefix.as_os_str().to_os_string();
    text.push(suffix);
    PathBuf::from(text)
}

/// Paths derived from the input image.
#[derive(Debug, Clone)]
pub struct DwiPaths {
    pub tmp_dir: PathBuf,
    pub prefix: PathBuf,
    pub tmp_prefix: PathBuf,
}

impl DwiPaths {
    pub fn for_input(input: &Path) -> Self {
        let folder = input.parent().map(Path::to_path_buf).unwrap_or_default();
        let tmp_dir = folder.join("tmp");
        let prefix = image_prefix(input);
        let base = prefix.file_name().map(PathBuf::from).unwrap_or_default();
        Self {
            tmp_prefix: tmp_dir.join(base),
            tmp_dir,
            prefix,
        }
    }

    pub fn out(&self, suffix: &str) -> PathBuf {
        suffixed(&self.prefix, suffix)
    }

    pub fn tmp(&self, suffix: &str) -> PathBuf {
        suffixed(&self.tmp_prefix, suffix)
    }

    pub fn brain_mask(&self) -> PathBuf {
        self.out("_brainMask.nrrd")
    }

    pub fn tensors(&self) -> PathBuf {
        self.out("_Tensors.nii.gz")
    }
}

/// Builds the step list; nothing runs until the pipeline is executed.
pub fn build_pipeline(options: &DwiOptions, toolchain: &Toolchain) -> Result<Pipeline, BidsError> {
    if options.direction > 2 {
        return Err(BidsError::InvalidOptions(format!(
            "direction must be 0, 1 or 2, got {}",
            options.direction
        )));
    }
    let Some(grad) = options.grad.clone() else {
        return Err(BidsError::InvalidOptions(
            "a gradient file (--grad) is required".to_string(),
        ));
    };

    let paths = DwiPaths::for_input(&options.input);
    let direction = options.direction.to_string();
    let anima = |name: &str| Invocation::new(toolchain.anima_tool(name));
    let mut pipeline = Pipeline::new();

    let mut image = options.input.clone();
    let mut bvec = grad;

    if !options.no_eddy_correction {
        let out_image = paths.tmp("_eddy_corrected.nrrd");
        let out_bvec = paths.tmp("_eddy_corrected.bvec");
        pipeline.push(
            Step::exec(
                "eddy-current-correction",
                anima("animaEddyCurrentCorrection")
                    .flag_path("-i", &image)
                    .flag_path("-I", &bvec)
                    .flag_path("-o", &out_image)
                    .flag_path("-O", &out_bvec)
                    .flag("-d", direction.clone()),
            )
            .reads([image.clone(), bvec.clone()])
            .writes([out_image.clone(), out_bvec.clone()]),
        );
        image = out_image;
        bvec = out_bvec;
    }

    let oriented = paths.tmp("_or.nrrd");
    pipeline.push(
        Step::exec(
            "reorient-axial",
            anima("animaConvertImage")
                .flag_path("-i", &image)
                .flag_path("-o", &oriented)
                .flag("-R", "AXIAL"),
        )
        .reads([image.clone()])
        .writes([oriented.clone()]),
    );
    image = oriented;

    let t1 = options.t1.as_ref().map(|path| T1Paths::new(path));
    let needs_t1_brain = !options.no_disto_correction || !options.no_brain_masking;
    if let (Some(t1), true) = (&t1, needs_t1_brain) {
        pipeline.push(
            Step::exec(
                "t1-brain-extraction",
                Invocation::new(&options.python)
                    .path(&toolchain.script(BRAIN_EXTRACTION_SCRIPT))
                    .flag_path("-i", &t1.image),
            )
            .reads([t1.image.clone()])
            .writes([t1.masked(), t1.brain_mask()]),
        );
    }

    if !options.no_disto_correction {
        if let Some(reverse) = &options.reverse {
            image = push_reverse_distortion(
                &mut pipeline,
                &paths,
                toolchain,
                &image,
                reverse,
                &direction,
            );
        } else if let Some(t1) = &t1 {
            image = push_t1_distortion(&mut pipeline, &paths, toolchain, &image, t1);
        } else {
            tracing::warn!("no reverse B0 nor T1 given, distortion correction skipped");
        }
    }

    if !options.no_denoising {
        let denoised = paths.tmp("_nlm.nrrd");
        pipeline.push(
            Step::exec(
                "nl-means-denoising",
                anima("animaNLMeansTemporal")
                    .flag_path("-i", &image)
                    .flag("-b", "0.5")
                    .flag_path("-o", &denoised),
            )
            .reads([image.clone()])
            .writes([denoised.clone()]),
        );
        image = denoised;
    }

    if !options.no_brain_masking {
        let for_extract = paths.tmp("_forBrainExtract.nrrd");
        pipeline.push(crop_b0("crop-b0-for-mask", toolchain, &image, &for_extract));

        match &t1 {
            None => {
                let produced = paths.tmp("_forBrainExtract_brainMask.nrrd");
                pipeline.push(
                    Step::exec(
                        "dwi-brain-extraction",
                        Invocation::new(&options.python)
                            .path(&toolchain.script(BRAIN_EXTRACTION_SCRIPT))
                            .path(&for_extract),
                    )
                    .reads([for_extract.clone()])
                    .writes([produced.clone()]),
                );
                pipeline.push(Step::move_file("store-brain-mask", produced, paths.brain_mask()));
            }
            Some(t1) => {
                let rigid = t1.out("_rig.nrrd");
                let rigid_tr = t1.out("_rig_tr.txt");
                let rigid_xml = t1.out("_rig_tr.xml");
                pipeline.push(
                    Step::exec(
                        "t1-rigid-registration",
                        anima("animaPyramidalBMRegistration")
                            .flag_path("-r", &for_extract)
                            .flag_path("-m", &t1.masked())
                            .flag_path("-o", &rigid)
                            .flag_path("-O", &rigid_tr),
                    )
                    .reads([for_extract.clone(), t1.masked()])
                    .writes([rigid, rigid_tr.clone()]),
                );
                pipeline.push(
                    Step::exec(
                        "t1-transform-xml",
                        anima("animaTransformSerieXmlGenerator")
                            .flag_path("-i", &rigid_tr)
                            .flag_path("-o", &rigid_xml),
                    )
                    .reads([rigid_tr])
                    .writes([rigid_xml.clone()]),
                );
                pipeline.push(
                    Step::exec(
                        "transfer-brain-mask",
                        anima("animaApplyTransformSerie")
                            .flag_path("-i", &t1.brain_mask())
                            .flag_path("-t", &rigid_xml)
                            .flag_path("-o", &paths.brain_mask())
                            .flag_path("-g", &for_extract)
                            .flag("-n", "nearest"),
                    )
                    .reads([t1.brain_mask(), rigid_xml, for_extract.clone()])
                    .writes([paths.brain_mask()]),
                );
                let masked = paths.tmp("_masked.nrrd");
                pipeline.push(
                    Step::exec(
                        "mask-dwi",
                        anima("animaMaskImage")
                            .flag_path("-i", &image)
                            .flag_path("-m", &paths.brain_mask())
                            .flag_path("-o", &masked),
                    )
                    .reads([image.clone(), paths.brain_mask()])
                    .writes([masked.clone()]),
                );
                image = masked;

                let preprocessed = paths.out("_preprocessed.nii.gz");
                pipeline.push(
                    Step::exec(
                        "export-preprocessed",
                        anima("animaConvertImage")
                            .flag_path("-i", &image)
                            .flag_path("-o", &preprocessed),
                    )
                    .reads([image.clone()])
                    .writes([preprocessed]),
                );
                pipeline.push(Step::copy_file(
                    "export-preprocessed-bvec",
                    bvec.clone(),
                    paths.out("_preprocessed.bvec"),
                ));
            }
        }
    }

    let mut dti = anima("animaDTIEstimator")
        .flag_path("-i", &image)
        .flag_path("-o", &paths.tensors())
        .flag_path("-O", &paths.out("_Tensors_B0.nrrd"))
        .flag_path("-N", &paths.out("_Tensors_NoiseVariance.nrrd"))
        .flag_path("-g", &bvec)
        .flag_path("-b", &options.bval);
    let mut dti_inputs = vec![image.clone(), bvec.clone(), options.bval.clone()];
    if !options.no_brain_masking {
        dti = dti.flag_path("-m", &paths.brain_mask());
        dti_inputs.push(paths.brain_mask());
    }
    pipeline.push(
        Step::exec("dti-estimation", dti)
            .reads(dti_inputs)
            .writes([paths.tensors()]),
    );

    if options.no_brain_masking {
        tracing::warn!("tractography needs a brain mask and is skipped");
    } else {
        let fibers = paths.out("_fiber_Tensor.vtk");
        pipeline.push(
            Step::exec(
                "dti-tractography",
                anima("animaDTITractography")
                    .flag("--max-length", "300")
                    .flag("--min-length", "10")
                    .flag("--nb-fibers", "2")
                    .flag_path("-o", &fibers)
                    .flag_path("-s", &paths.brain_mask())
                    .flag_path("-i", &paths.tensors()),
            )
            .reads([paths.brain_mask(), paths.tensors()])
            .writes([fibers]),
        );
    }

    let (rd, ad, fa, adc) = (
        paths.out("_RD.nii.gz"),
        paths.out("_AD.nii.gz"),
        paths.out("_FA.nii.gz"),
        paths.out("_ADC.nii.gz"),
    );
    pipeline.push(
        Step::exec(
            "dti-scalar-maps",
            anima("animaDTIScalarMaps")
                .flag_path("-r", &rd)
                .flag_path("-i", &paths.tensors())
                .flag_path("-x", &ad)
                .flag_path("-f", &fa)
                .flag_path("-a", &adc),
        )
        .reads([paths.tensors()])
        .writes([rd, ad, fa, adc]),
    );

    Ok(pipeline)
}

struct T1Paths {
    image: PathBuf,
    prefix: PathBuf,
}

impl T1Paths {
    fn new(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            prefix: image_prefix(image),
        }
    }

    fn out(&self, suffix: &str) -> PathBuf {
        suffixed(&self.prefix, suffix)
    }

    fn masked(&self) -> PathBuf {
        self.out("_masked.nrrd")
    }

    fn brain_mask(&self) -> PathBuf {
        self.out("_brainMask.nrrd")
    }
}

fn crop_b0(name: &str, toolchain: &Toolchain, image: &Path, output: &Path) -> Step {
    Step::exec(
        name,
        Invocation::new(toolchain.anima_tool("animaCropImage"))
            .flag_path("-i", image)
            .flag("-t", "0")
            .flag("-T", "0")
            .flag_path("-o", output),
    )
    .reads([image.to_path_buf()])
    .writes([output.to_path_buf()])
}

/// Reverse phase-encoding B0 correction. Returns the corrected image path.
fn push_reverse_distortion(
    pipeline: &mut Pipeline,
    paths: &DwiPaths,
    toolchain: &Toolchain,
    image: &Path,
    reverse: &Path,
    direction: &str,
) -> PathBuf {
    let anima = |name: &str| Invocation::new(toolchain.anima_tool(name));
    let b0 = paths.tmp("_B0.nrrd");
    let b0_reverse = paths.tmp("_B0_Reverse.nrrd");
    let id_txt = toolchain.extra_data_root.join("id.txt");
    let id_xml = paths.tmp_dir.join("id.xml");
    let init_tr = paths.tmp("_init_correction_tr.nrrd");
    let b0_corrected = paths.tmp("_B0_corrected.nrrd");
    let correction_tr = paths.tmp("_B0_correction_tr.nrrd");
    let corrected = paths.tmp("_corrected.nrrd");

    pipeline.push(crop_b0("crop-b0", toolchain, image, &b0));
    pipeline.push(
        Step::exec(
            "identity-transform-xml",
            anima("animaTransformSerieXmlGenerator")
                .flag_path("-i", &id_txt)
                .flag_path("-o", &id_xml),
        )
        .reads([id_txt.clone()])
        .writes([id_xml.clone()]),
    );
    pipeline.push(
        Step::exec(
            "resample-reverse-b0",
            anima("animaApplyTransformSerie")
                .flag_path("-i", reverse)
                .flag_path("-t", &id_xml)
                .flag_path("-o", &b0_reverse)
                .flag_path("-g", &b0),
        )
        .reads([reverse.to_path_buf(), id_xml, b0.clone()])
        .writes([b0_reverse.clone()]),
    );
    pipeline.push(
        Step::exec(
            "initial-distortion-correction",
            anima("animaDistortionCorrection")
                .flag("-s", "2")
                .flag("-d", direction)
                .flag_path("-f", &b0)
                .flag_path("-b", &b0_reverse)
                .flag_path("-o", &init_tr),
        )
        .reads([b0.clone(), b0_reverse.clone()])
        .writes([init_tr.clone()]),
    );
    pipeline.push(
        Step::exec(
            "block-matching-distortion-correction",
            anima("animaBMDistortionCorrection")
                .flag_path("-f", &b0)
                .flag_path("-b", &b0_reverse)
                .flag_path("-o", &b0_corrected)
                .flag_path("-i", &init_tr)
                .flag("--bs", "3")
                .flag("-s", "10")
                .flag("-d", direction)
                .flag_path("-O", &correction_tr),
        )
        .reads([b0, b0_reverse, init_tr])
        .writes([b0_corrected, correction_tr.clone()]),
    );
    pipeline.push(apply_correction(toolchain, image, &correction_tr, &corrected));
    corrected
}

/// B0 to T1 registration when no reverse B0 was acquired.
fn push_t1_distortion(
    pipeline: &mut Pipeline,
    paths: &DwiPaths,
    toolchain: &Toolchain,
    image: &Path,
    t1: &T1Paths,
) -> PathBuf {
    let anima = |name: &str| Invocation::new(toolchain.anima_tool(name));
    let b0 = paths.tmp("_B0.nrrd");
    let t1_in_dwi = t1.out("_dwi.nrrd");
    let t1_rigid_tr = t1.out("_rig_tr.txt");
    let b0_corrected = paths.tmp("_B0_corrected.nrrd");
    let correction_tr = paths.out("_B0_correction_tr.nrrd");
    let corrected = paths.tmp("_corrected.nrrd");

    pipeline.push(crop_b0("crop-b0", toolchain, image, &b0));
    pipeline.push(
        Step::exec(
            "t1-to-b0-rigid-registration",
            anima("animaPyramidalBMRegistration")
                .flag_path("-r", &b0)
                .flag_path("-m", &t1.masked())
                .flag_path("-o", &t1_in_dwi)
                .flag_path("-O", &t1_rigid_tr),
        )
        .reads([b0.clone(), t1.masked()])
        .writes([t1_in_dwi.clone(), t1_rigid_tr]),
    );
    pipeline.push(
        Step::exec(
            "b0-dense-registration",
            anima("animaDenseSVFBMRegistration")
                .flag_path("-r", &t1_in_dwi)
                .flag_path("-m", &b0)
                .flag_path("-o", &b0_corrected)
                .flag_path("-O", &correction_tr)
                .flag("-t", "3"),
        )
        .reads([t1_in_dwi, b0])
        .writes([b0_corrected, correction_tr.clone()]),
    );
    pipeline.push(apply_correction(toolchain, image, &correction_tr, &corrected));
    corrected
}

fn apply_correction(toolchain: &Toolchain, image: &Path, transform: &Path, output: &Path) -> Step {
    Step::exec(
        "apply-distortion-correction",
        Invocation::new(toolchain.anima_tool("animaApplyDistortionCorrection"))
            .flag_path("-f", image)
            .flag_path("-t", transform)
            .flag_path("-o", output),
    )
    .reads([image.to_path_buf(), transform.to_path_buf()])
    .writes([output.to_path_buf()])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain() -> Toolchain {
        Toolchain {
            anima_dir: PathBuf::from("/opt/anima"),
            extra_data_root: PathBuf::from("/opt/anima-data"),
            scripts_root: PathBuf::from("/opt/anima-scripts"),
        }
    }

    #[test]
    fn prefix_strips_double_extension() {
        assert_eq!(
            image_prefix(Path::new("/d/sub/dwi_sub.nii.gz")),
            PathBuf::from("/d/sub/dwi_sub")
        );
        assert_eq!(image_prefix(Path::new("/d/t1.nrrd")), PathBuf::from("/d/t1"));
    }

    #[test]
    fn minimal_chain_without_optional_steps() {
        let mut options = DwiOptions::new(
            PathBuf::from("/d/s/dwi_s.nii.gz"),
            PathBuf::from("/d/s/encoding_s.bval"),
        );
        options.grad = Some(PathBuf::from("/d/s/encoding_s.bvec"));
        options.no_eddy_correction = true;
        options.no_disto_correction = true;
        options.no_denoising = true;
        options.no_brain_masking = true;

        let pipeline = build_pipeline(&options, &toolchain()).unwrap();
        assert_eq!(
            pipeline.step_names(),
            vec!["reorient-axial", "dti-estimation", "dti-scalar-maps"]
        );
    }

    #[test]
    fn gradient_file_is_required() {
        let options = DwiOptions::new(PathBuf::from("/d/dwi.nii.gz"), PathBuf::from("/d/b.bval"));
        assert!(matches!(
            build_pipeline(&options, &toolchain()),
            Err(BidsError::InvalidOptions(_))
        ));
    }
}
